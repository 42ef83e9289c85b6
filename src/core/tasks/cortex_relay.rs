//! One-shot relay of a payload between cortices.

use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::core::error::TaskError;
use crate::core::task::{TaskContext, TaskControl};
use crate::util::ids::task_name;

/// Delivers `data` from `source` to the `target` endpoint once.
#[derive(Debug)]
pub struct CortexRelayTask {
    control: TaskControl,
    source: String,
    target: String,
    data: Value,
}

impl CortexRelayTask {
    /// Relay `data` from `source` to `target`.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>, data: Value) -> Self {
        Self {
            control: TaskControl::new(task_name("relay"), 2, Duration::ZERO),
            source: source.into(),
            target: target.into(),
            data,
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

    /// Sending cortex.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Receiving cortex.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub(crate) async fn execute(&self, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        info!(source = %self.source, target = %self.target, "Relaying data");
        let reply = ctx
            .cortices
            .relay(&self.source, &self.target, self.data.clone())
            .await?;
        Ok(Some(reply))
    }
}
