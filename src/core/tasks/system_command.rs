//! One-shot `sys` commands.

use std::time::Duration;

use serde_json::{json, Value};

use crate::core::envelope::CommandEnvelope;
use crate::core::error::TaskError;
use crate::core::task::{TaskContext, TaskControl};
use crate::util::clock::now_secs_f64;
use crate::util::ids::task_name;

/// Sends a single system command and stores
/// `{"success", "response", "timestamp"}` as its result.
#[derive(Debug)]
pub struct SystemCommandTask {
    control: TaskControl,
    command: CommandEnvelope,
}

impl SystemCommandTask {
    /// Command `action` with `data`, in the `system` object namespace.
    #[must_use]
    pub fn new(action: &str, data: Value) -> Self {
        Self::from_envelope(CommandEnvelope::system(action, data))
    }

    /// Wrap a prepared envelope.
    #[must_use]
    pub fn from_envelope(command: CommandEnvelope) -> Self {
        Self {
            control: TaskControl::new(
                task_name(&format!("system-{}", command.action)),
                3,
                Duration::from_millis(100),
            ),
            command,
        }
    }

    /// Override the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.control = self.control.with_priority(priority);
        self
    }

    /// Lifecycle block.
    #[must_use]
    pub const fn control(&self) -> &TaskControl {
        &self.control
    }

    /// The envelope this task sends.
    #[must_use]
    pub const fn command(&self) -> &CommandEnvelope {
        &self.command
    }

    /// Whether the stored result reports success.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.control
            .result()
            .and_then(|r| r.get("success").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    pub(crate) async fn execute(&self, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        if self.command.action.is_empty() {
            return Err(TaskError::NoCommand);
        }
        let response = ctx.comm.send_command(&self.command).await;
        Ok(Some(json!({
            "success": response.is_success(),
            "response": response.to_value(),
            "timestamp": now_secs_f64(),
        })))
    }
}
