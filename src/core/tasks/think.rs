//! LLM inference dispatched off the scheduler tick.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, error};

use super::display_sink::DisplaySinkTask;
use crate::core::envelope::CommandEnvelope;
use crate::core::error::TaskError;
use crate::core::task::{panic_message, TaskContext, TaskControl};
use crate::core::Spawn;
use crate::util::ids::task_name;

/// Runs one prompt through the device LLM.
///
/// The first scheduled run spawns the request on the runtime and returns
/// immediately; the task completes itself once the answer (or an error) is
/// stored. Callers await [`TaskControl::wait_completed`].
#[derive(Debug)]
pub struct ThinkTask {
    control: TaskControl,
    prompt: String,
    stream: bool,
    visual: Option<Arc<DisplaySinkTask>>,
    dispatched: AtomicBool,
}

impl ThinkTask {
    /// Inference for `prompt`, streamed or not.
    #[must_use]
    pub fn new(prompt: impl Into<String>, stream: bool) -> Self {
        Self {
            control: TaskControl::new(task_name("think"), 3, Duration::ZERO),
            prompt: prompt.into(),
            stream,
            visual: None,
            dispatched: AtomicBool::new(false),
        }
    }

    /// Feed output into a display task.
    #[must_use]
    pub fn with_visual(mut self, visual: Arc<DisplaySinkTask>) -> Self {
        self.visual = Some(visual);
        self
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

    /// The prompt.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Whether the request has been handed to the runtime.
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    pub(crate) fn dispatch(self: &Arc<Self>, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        if self.dispatched.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let task = Arc::clone(self);
        let job_ctx = ctx.clone();
        ctx.spawner.spawn(async move {
            let value = AssertUnwindSafe(task.infer(&job_ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let err = TaskError::Panicked(panic_message(&*panic));
                    error!(task = %task.control.name(), error = %err, "Think job panicked");
                    json!({ "error": err.to_string() })
                });
            task.control.set_result(value);
            if let Some(visual) = &task.visual {
                visual.mark_complete();
            }
            task.control.stop();
        });
        debug!(task = %self.control.name(), stream = self.stream, "Inference dispatched");
        Ok(None)
    }

    async fn infer(&self, ctx: &TaskContext) -> Value {
        let command = CommandEnvelope::inference(&ctx.cache.llm_work_id(), &self.prompt, self.stream);
        let response = if self.stream {
            let visual = self.visual.clone();
            ctx.comm
                .send_streaming(&command, move |delta| {
                    if let Some(visual) = &visual {
                        visual.append(delta);
                    }
                })
                .await
        } else {
            ctx.comm.send_command(&command).await
        };

        if !response.is_success() {
            error!(
                task = %self.control.name(),
                code = response.error_code(),
                error = %response.error_message(),
                "Inference failed"
            );
            return json!({ "error": response.error_message() });
        }
        let text = answer_text(response.data);
        if !self.stream {
            if let (Some(visual), Some(s)) = (&self.visual, text.as_str()) {
                visual.update_stream(s, true);
            }
        }
        text
    }
}

/// Reduce an inference payload to its text when it has one.
fn answer_text(data: Value) -> Value {
    match data {
        Value::Object(fields) => {
            match fields
                .get("delta")
                .or_else(|| fields.get("generated_text"))
                .and_then(Value::as_str)
            {
                Some(text) => Value::String(text.to_string()),
                None => Value::Object(fields),
            }
        }
        other => other,
    }
}
