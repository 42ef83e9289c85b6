//! Model listing and LLM unit setup.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::core::cache::ModelInfo;
use crate::core::envelope::{CommandEnvelope, LlmSetup, ResponseEnvelope};
use crate::core::error::TaskError;
use crate::core::task::{TaskContext, TaskControl};

/// Name the model task registers under.
pub const MODEL_MANAGEMENT_TASK: &str = "model_management";

fn device_error(response: &ResponseEnvelope) -> TaskError {
    TaskError::Device {
        code: response.error_code(),
        message: response.error_message().to_string(),
    }
}

/// Refreshes the model listing on a slow cadence.
#[derive(Debug)]
pub struct ModelManagementTask {
    control: TaskControl,
}

impl Default for ModelManagementTask {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl ModelManagementTask {
    /// Task listing models every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            control: TaskControl::new(MODEL_MANAGEMENT_TASK, 4, interval),
        }
    }

    /// Lifecycle block.
    #[must_use]
    pub const fn control(&self) -> &TaskControl {
        &self.control
    }

    /// List models with `sys`/`lsmode` and cache them. Entries that do not
    /// parse are skipped.
    ///
    /// # Errors
    ///
    /// `Device` on an error envelope, `InvalidResponse` if `data` is not a list.
    pub async fn refresh(ctx: &TaskContext) -> Result<Vec<ModelInfo>, TaskError> {
        let response = ctx.comm.send_command(&CommandEnvelope::list_models()).await;
        if !response.is_success() {
            return Err(device_error(&response));
        }
        let entries = match response.data {
            Value::Array(entries) => entries,
            other => {
                return Err(TaskError::InvalidResponse(format!(
                    "lsmode payload is not a list: {other}"
                )))
            }
        };
        let models: Vec<ModelInfo> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry) {
                Ok(model) => Some(model),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed model entry");
                    None
                }
            })
            .collect();
        info!(count = models.len(), "Model list refreshed");
        ctx.cache.set_models(models.clone());
        Ok(models)
    }

    /// Set up the LLM unit with `model` and remember the returned work id.
    ///
    /// # Errors
    ///
    /// `Device` if the device rejects the setup.
    pub async fn set_active_model(ctx: &TaskContext, model: &str) -> Result<String, TaskError> {
        let response = ctx
            .comm
            .send_command(&CommandEnvelope::llm_setup(&LlmSetup::for_model(model)))
            .await;
        if !response.is_success() {
            return Err(device_error(&response));
        }
        let work_id = if response.work_id.is_empty() {
            ctx.cache.llm_work_id()
        } else {
            response.work_id
        };
        ctx.cache.set_active_model(model, work_id.clone());
        info!(model, work_id = %work_id, "Active model set");
        Ok(work_id)
    }

    /// Unload every LLM unit with `sys`/`reset`.
    ///
    /// # Errors
    ///
    /// `Device` if the device rejects the reset.
    pub async fn reset_llm(ctx: &TaskContext) -> Result<(), TaskError> {
        let response = ctx.comm.send_command(&CommandEnvelope::reset()).await;
        if !response.is_success() {
            return Err(device_error(&response));
        }
        ctx.cache.clear_active_model();
        info!("LLM reset");
        Ok(())
    }

    pub(crate) async fn execute(&self, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        let models = Self::refresh(ctx).await?;
        serde_json::to_value(models)
            .map(Some)
            .map_err(|e| TaskError::InvalidResponse(e.to_string()))
    }
}
