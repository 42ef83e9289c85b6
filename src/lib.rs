//! # Basal Ganglia
//!
//! A cooperative, priority-ordered task scheduler plus the transport layer
//! that carries newline-delimited JSON commands to a single remote LLM
//! device over a serial port, TCP/WiFi, or a port forwarded through ADB.
//!
//! ## Layout
//!
//! - [`core`]: the task model ([`NeuralTask`]), the scheduler
//!   ([`BasalGanglia`]), the [`CommunicationTask`] that owns the only
//!   device connection, and the concrete tasks (hardware polling, model
//!   management, inference, system commands, cortex relays and display).
//! - [`transport`]: the [`Transport`] trait and its serial, TCP and ADB
//!   implementations, with IP rediscovery for the TCP path.
//! - [`config`]: JSON file plus environment overrides.
//! - [`runtime`]: the [`SynapticPathways`] façade and the tokio spawner.
//! - [`builders`]: wiring the façade from configuration.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use basal_ganglia::builders::PathwaysBuilder;
//!
//! # async fn run() -> anyhow::Result<()> {
//! basal_ganglia::util::init_tracing();
//! let pathways = PathwaysBuilder::from_env()?.build()?;
//! if pathways.initialize_default().await {
//!     let answer = pathways.think("What is the capital of France?", false).await;
//!     println!("{answer}");
//! }
//! pathways.final_shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Every device exchange is serialized through one communication task, so
//! concurrent callers never interleave bytes on the wire. Long-running
//! inference is dispatched in the background; the scheduler loop keeps
//! ticking while a model generates.

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod builders;
pub mod config;
pub mod core;
pub mod infra;
pub mod runtime;
pub mod transport;
pub mod util;

pub use crate::builders::PathwaysBuilder;
pub use crate::config::{PathwaysConfig, SharedConfig};
pub use crate::core::{
    BasalGanglia, CommandEnvelope, CommunicationTask, NeuralTask, ResponseEnvelope, TaskContext,
    TaskError, TransportError,
};
pub use crate::runtime::{PathwaysHealth, SynapticPathways, TokioSpawner};
pub use crate::transport::{ConnectionType, Transport, TransportFactory};
