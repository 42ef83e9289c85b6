//! Periodic hardware polling.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::core::cache::HardwareSnapshot;
use crate::core::envelope::CommandEnvelope;
use crate::core::error::TaskError;
use crate::core::task::{TaskContext, TaskControl};
use crate::util::clock::now_secs;

/// Name the hardware task registers under.
pub const HARDWARE_INFO_TASK: &str = "hardware_info";

/// Polls `sys`/`hwinfo` and keeps the cached snapshot fresh.
#[derive(Debug)]
pub struct HardwareInfoTask {
    control: TaskControl,
}

impl Default for HardwareInfoTask {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl HardwareInfoTask {
    /// Task polling every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            control: TaskControl::new(HARDWARE_INFO_TASK, 5, interval),
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

    /// Fetch a fresh snapshot and store it in the cache.
    ///
    /// # Errors
    ///
    /// `Device` if the device reports an error, `InvalidResponse` if the
    /// payload is not an object.
    pub async fn refresh(ctx: &TaskContext) -> Result<HardwareSnapshot, TaskError> {
        let response = ctx.comm.send_command(&CommandEnvelope::hwinfo()).await;
        if !response.is_success() {
            return Err(TaskError::Device {
                code: response.error_code(),
                message: response.error_message().to_string(),
            });
        }
        let snapshot = HardwareSnapshot::from_data(&response.data, now_secs())?;
        debug!(summary = %snapshot.format(), "Hardware info refreshed");
        ctx.cache.set_hardware(snapshot.clone());
        Ok(snapshot)
    }

    pub(crate) async fn execute(&self, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        let snapshot = Self::refresh(ctx).await?;
        serde_json::to_value(snapshot)
            .map(Some)
            .map_err(|e| TaskError::InvalidResponse(e.to_string()))
    }
}
