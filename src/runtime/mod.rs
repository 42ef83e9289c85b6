//! Runtime adapters and the façade peripheral modules talk to.

pub mod api;
pub mod pathways;
pub mod tokio_spawner;

pub use api::{PathwaysHealth, TaskStatusResponse};
pub use pathways::SynapticPathways;
pub use tokio_spawner::TokioSpawner;
