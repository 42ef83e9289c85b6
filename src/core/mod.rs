//! Task model, scheduler and the communication task.

pub mod audit;
pub mod cache;
pub mod communication;
pub mod envelope;
pub mod error;
pub mod relay;
pub mod scheduler;
pub mod task;
pub mod tasks;

use std::future::Future;

pub use audit::{AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use cache::{DeviceCache, HardwareSnapshot, LlmSelection, ModelInfo};
pub use communication::{CommunicationTask, StreamChunk, COMMUNICATION_TASK};
pub use envelope::{CommandEnvelope, ErrorBody, LlmSetup, ResponseEnvelope};
pub use error::{AppResult, ConfigError, SchedulerError, TaskError, TransportError};
pub use relay::{CortexEndpoint, CortexRegistry};
pub use scheduler::{BasalGanglia, SchedulerStats, TickReport};
pub use task::{NeuralTask, RunOutcome, TaskContext, TaskControl, TaskState};
pub use tasks::{
    CortexRelayTask, DisplayFrame, DisplaySink, DisplaySinkTask, HardwareInfoTask,
    ModelManagementTask, StreamOptions, SystemCommandTask, ThinkTask, TracingDisplay,
};

/// Abstraction for spawning background jobs on a runtime.
pub trait Spawn {
    /// Run `fut` to completion in the background.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
