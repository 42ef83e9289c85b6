//! Serializable snapshots returned by the façade.

use serde::Serialize;
use serde_json::Value;

use crate::core::cache::{HardwareSnapshot, LlmSelection};
use crate::core::scheduler::SchedulerStats;
use crate::core::task::{NeuralTask, TaskState};
use crate::transport::ConnectionType;

/// State of one registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusResponse {
    /// Task name.
    pub task: String,
    /// Variant.
    pub kind: &'static str,
    /// Lifecycle state.
    pub state: TaskState,
    /// Priority.
    pub priority: i32,
    /// Completed executions.
    pub runs: u64,
    /// Last stored result.
    pub result: Option<Value>,
}

impl TaskStatusResponse {
    /// Snapshot of `task`.
    #[must_use]
    pub fn from_task(task: &NeuralTask) -> Self {
        let control = task.control();
        Self {
            task: control.name().to_string(),
            kind: task.kind(),
            state: control.state(),
            priority: control.priority(),
            runs: control.runs(),
            result: control.result(),
        }
    }
}

/// Façade health.
#[derive(Debug, Clone, Serialize)]
pub struct PathwaysHealth {
    /// Initialized and connected.
    pub ok: bool,
    /// `initialize` has succeeded since the last cleanup.
    pub initialized: bool,
    /// Live transport session.
    pub connected: bool,
    /// Current transport type.
    pub connection_type: Option<ConnectionType>,
    /// Current endpoint.
    pub endpoint: Option<String>,
    /// Scheduler counters, once the scheduler exists.
    pub scheduler: Option<SchedulerStats>,
    /// Cached hardware snapshot.
    pub hardware: HardwareSnapshot,
    /// LLM selection.
    pub llm: LlmSelection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tasks::CortexRelayTask;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn task_status_serializes_state_in_snake_case() {
        let task = NeuralTask::from(Arc::new(
            CortexRelayTask::new("a", "b", json!({})).with_priority(7),
        ));
        task.control().pause();
        let status = serde_json::to_value(TaskStatusResponse::from_task(&task)).unwrap();
        assert_eq!(status["kind"], "cortex_relay");
        assert_eq!(status["state"], "paused");
        assert_eq!(status["priority"], 7);
        assert_eq!(status["runs"], 0);
        assert!(status["result"].is_null());
    }
}
