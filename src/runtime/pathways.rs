//! SynapticPathways: the single entry point peripheral modules use.
//!
//! An explicit context object rather than process globals. It owns the task
//! context (communication task, device cache, cortex registry, display) and
//! lazily creates exactly one scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::api::{PathwaysHealth, TaskStatusResponse};
use crate::config::{PathwaysConfig, SharedConfig};
use crate::core::cache::{HardwareSnapshot, ModelInfo};
use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::{SchedulerError, TaskError};
use crate::core::relay::CortexEndpoint;
use crate::core::scheduler::BasalGanglia;
use crate::core::task::{NeuralTask, TaskContext, TaskControl};
use crate::core::tasks::{
    CortexRelayTask, DisplaySinkTask, HardwareInfoTask, ModelManagementTask, StreamOptions,
    SystemCommandTask, ThinkTask,
};
use crate::transport::ConnectionType;

/// Façade over the scheduler, the communication task and the device cache.
pub struct SynapticPathways {
    config: PathwaysConfig,
    shared: SharedConfig,
    ctx: TaskContext,
    scheduler: OnceLock<Arc<BasalGanglia>>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl SynapticPathways {
    /// Façade over `ctx`. Use [`PathwaysBuilder`](crate::builders::PathwaysBuilder)
    /// to wire one from configuration.
    #[must_use]
    pub fn new(config: PathwaysConfig, shared: SharedConfig, ctx: TaskContext) -> Self {
        Self {
            config,
            shared,
            ctx,
            scheduler: OnceLock::new(),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The scheduler, created on first use.
    pub fn basal_ganglia(&self) -> &Arc<BasalGanglia> {
        self.scheduler.get_or_init(|| {
            info!("Creating scheduler");
            Arc::new(BasalGanglia::new(self.config.scheduler.clone(), self.ctx.clone()))
        })
    }

    /// Task context shared with every task.
    #[must_use]
    pub const fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Live device configuration, including any rediscovered IP.
    #[must_use]
    pub const fn shared_config(&self) -> &SharedConfig {
        &self.shared
    }

    /// Connect with the configured default transport.
    pub async fn initialize_default(&self) -> bool {
        self.initialize(self.config.device.connection.default_type).await
    }

    /// Connect with a transport named `serial`, `tcp`, `wifi` or `adb`.
    pub async fn initialize_named(&self, kind: &str) -> bool {
        match kind.parse::<ConnectionType>() {
            Ok(kind) => self.initialize(kind).await,
            Err(e) => {
                warn!(error = %e, "Cannot initialize");
                false
            }
        }
    }

    /// Connect through `kind`, falling back per the connection policy, then
    /// register the polling tasks and start the scheduler and the monitor.
    pub async fn initialize(&self, kind: ConnectionType) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            warn!("initialize after final shutdown");
            return false;
        }
        let comm = &self.ctx.comm;
        if !comm.initialize(kind).await && !self.try_fallbacks(kind).await {
            warn!(connection = %kind, "Could not connect to device");
            return false;
        }

        let cadence = &self.config.scheduler.cadence;
        let scheduler = self.basal_ganglia();
        let registered = scheduler
            .register_task(Arc::clone(comm))
            .and_then(|()| {
                scheduler.register_task(Arc::new(HardwareInfoTask::new(cadence.hardware_info())))
            })
            .and_then(|()| {
                scheduler.register_task(Arc::new(ModelManagementTask::new(
                    cadence.model_management(),
                )))
            });
        if let Err(e) = registered {
            warn!(error = %e, "Could not register core tasks");
            return false;
        }
        scheduler.start();
        comm.start_monitor();
        self.initialized.store(true, Ordering::Release);
        info!(
            connection = ?comm.connection_type(),
            endpoint = ?comm.endpoint(),
            "Pathways initialized"
        );
        true
    }

    async fn try_fallbacks(&self, failed: ConnectionType) -> bool {
        let policy = &self.config.device.connection;
        let candidates = policy
            .fallback
            .iter()
            .copied()
            .filter(|k| *k != failed)
            .take(policy.max_fallback_attempts);
        for kind in candidates {
            warn!(failed = %failed, fallback = %kind, "Trying fallback transport");
            if self.ctx.comm.initialize(kind).await {
                return true;
            }
        }
        false
    }

    /// Whether `initialize` has succeeded since the last cleanup.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether the transport has a live session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.ctx.comm.is_connected()
    }

    /// Current transport type.
    #[must_use]
    pub fn connection_type(&self) -> Option<ConnectionType> {
        self.ctx.comm.connection_type()
    }

    /// Send one command to the device. Always returns an envelope.
    pub async fn send_command(&self, command: &CommandEnvelope) -> ResponseEnvelope {
        self.ctx.comm.send_command(command).await
    }

    /// Run a task inline when no loop is ticking, so callers waiting on it
    /// still make progress.
    async fn drive(&self, task: NeuralTask) {
        if !self.basal_ganglia().is_running() {
            task.run(&self.ctx).await;
        }
    }

    async fn wait(control: &TaskControl, budget: Duration) -> bool {
        tokio::time::timeout(budget, control.wait_completed())
            .await
            .is_ok()
    }

    /// Schedule an inference without waiting for it.
    ///
    /// # Errors
    ///
    /// Scheduler registration errors.
    pub fn think_task(
        &self,
        prompt: &str,
        stream: bool,
        visual: Option<Arc<DisplaySinkTask>>,
    ) -> Result<Arc<ThinkTask>, SchedulerError> {
        let mut task = ThinkTask::new(prompt, stream);
        if let Some(visual) = visual {
            task = task.with_visual(visual);
        }
        let task = Arc::new(task);
        self.basal_ganglia().register_task(Arc::clone(&task))?;
        Ok(task)
    }

    /// Run `prompt` through the LLM and wait for the answer.
    ///
    /// Returns the generated text, or `{"error": message}` on failure or
    /// when the wait budget runs out.
    pub async fn think(&self, prompt: &str, stream: bool) -> Value {
        let task = match self.think_task(prompt, stream, None) {
            Ok(task) => task,
            Err(e) => return json!({ "error": e.to_string() }),
        };
        self.await_think(&task).await
    }

    /// Like [`think`](Self::think), rendering the stream on a display task.
    pub async fn think_with_display(&self, prompt: &str, options: StreamOptions) -> Value {
        let visual = match self.display_llm_stream(options) {
            Ok(visual) => visual,
            Err(e) => return json!({ "error": e.to_string() }),
        };
        let task = match self.think_task(prompt, true, Some(visual)) {
            Ok(task) => task,
            Err(e) => return json!({ "error": e.to_string() }),
        };
        self.await_think(&task).await
    }

    async fn await_think(&self, task: &Arc<ThinkTask>) -> Value {
        self.drive(NeuralTask::Think(Arc::clone(task))).await;
        let budget = Duration::from_secs(self.config.scheduler.wait.think_timeout_secs);
        if !Self::wait(task.control(), budget).await {
            warn!(task = %task.control().name(), ?budget, "Think timed out");
            return json!({ "error": format!("Timeout waiting for thought after {budget:?}") });
        }
        task.control().result().unwrap_or(Value::Null)
    }

    /// Schedule a system command and wait for its result.
    pub async fn system_command(&self, action: &str, data: Value) -> Option<Value> {
        let task = Arc::new(SystemCommandTask::new(action, data));
        if let Err(e) = self.basal_ganglia().register_task(Arc::clone(&task)) {
            warn!(action, error = %e, "Could not schedule system command");
            return None;
        }
        self.drive(NeuralTask::SystemCommand(Arc::clone(&task))).await;
        let budget = Duration::from_millis(self.config.scheduler.wait.task_timeout_ms);
        if !Self::wait(task.control(), budget).await {
            warn!(action, ?budget, "System command timed out");
            return None;
        }
        task.control().result()
    }

    async fn system_succeeded(&self, action: &str) -> bool {
        self.system_command(action, Value::Null)
            .await
            .and_then(|r| r.get("success").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    /// `sys`/`ping`.
    pub async fn ping_system(&self) -> bool {
        self.system_succeeded("ping").await
    }

    /// `sys`/`reboot`.
    pub async fn reboot_device(&self) -> bool {
        self.system_succeeded("reboot").await
    }

    /// Cached hardware snapshot.
    #[must_use]
    pub fn get_hardware_info(&self) -> HardwareSnapshot {
        self.ctx.cache.hardware()
    }

    /// Fetch a fresh snapshot, falling back to the cached one on failure.
    pub async fn refresh_hardware_info(&self) -> HardwareSnapshot {
        match HardwareInfoTask::refresh(&self.ctx).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Hardware refresh failed, using cached values");
                self.get_hardware_info()
            }
        }
    }

    /// One-line rendering of the cached snapshot.
    #[must_use]
    pub fn format_hw_info(&self) -> String {
        self.get_hardware_info().format()
    }

    /// Cached model listing.
    #[must_use]
    pub fn get_available_models(&self) -> Vec<ModelInfo> {
        self.ctx.cache.models()
    }

    /// Fetch the model listing, falling back to the cached one on failure.
    pub async fn refresh_models(&self) -> Vec<ModelInfo> {
        match ModelManagementTask::refresh(&self.ctx).await {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "Model refresh failed, using cached list");
                self.get_available_models()
            }
        }
    }

    /// Load `model` into the LLM unit.
    pub async fn set_active_model(&self, model: &str) -> bool {
        match ModelManagementTask::set_active_model(&self.ctx, model).await {
            Ok(_) => true,
            Err(e) => {
                warn!(model, error = %e, "Could not set active model");
                false
            }
        }
    }

    /// Unload every LLM unit.
    pub async fn reset_llm(&self) -> bool {
        match ModelManagementTask::reset_llm(&self.ctx).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "LLM reset failed");
                false
            }
        }
    }

    /// Schedule a one-shot text display.
    ///
    /// # Errors
    ///
    /// Scheduler registration errors.
    pub fn display_text(&self, content: &str) -> Result<Arc<DisplaySinkTask>, SchedulerError> {
        let task = Arc::new(DisplaySinkTask::text(content));
        self.basal_ganglia().register_task(Arc::clone(&task))?;
        Ok(task)
    }

    /// Schedule a streaming display that follows appended text.
    ///
    /// # Errors
    ///
    /// Scheduler registration errors.
    pub fn display_llm_stream(
        &self,
        options: StreamOptions,
    ) -> Result<Arc<DisplaySinkTask>, SchedulerError> {
        let task = Arc::new(DisplaySinkTask::llm_stream(options));
        self.basal_ganglia().register_task(Arc::clone(&task))?;
        Ok(task)
    }

    /// Register a cortex endpoint.
    pub fn register_cortex(&self, name: &str, endpoint: Arc<dyn CortexEndpoint>) {
        self.ctx.cortices.register(name, endpoint);
    }

    /// Deliver `data` from `source` to `target` now.
    ///
    /// # Errors
    ///
    /// `UnknownCortex` or the endpoint's own error.
    pub async fn relay_between_cortices(
        &self,
        source: &str,
        target: &str,
        data: Value,
    ) -> Result<Value, TaskError> {
        self.ctx.cortices.relay(source, target, data).await
    }

    /// Schedule a relay as a one-shot task.
    ///
    /// # Errors
    ///
    /// Scheduler registration errors.
    pub fn schedule_relay(
        &self,
        source: &str,
        target: &str,
        data: Value,
    ) -> Result<Arc<CortexRelayTask>, SchedulerError> {
        let task = Arc::new(CortexRelayTask::new(source, target, data));
        self.basal_ganglia().register_task(Arc::clone(&task))?;
        Ok(task)
    }

    /// Status of every registered task.
    #[must_use]
    pub fn task_statuses(&self) -> Vec<TaskStatusResponse> {
        let scheduler = self.basal_ganglia();
        scheduler
            .task_names()
            .iter()
            .filter_map(|name| scheduler.get_task(name))
            .map(|task| TaskStatusResponse::from_task(&task))
            .collect()
    }

    /// Health snapshot.
    #[must_use]
    pub fn status(&self) -> PathwaysHealth {
        let comm = &self.ctx.comm;
        PathwaysHealth {
            ok: self.is_initialized() && comm.is_connected(),
            initialized: self.is_initialized(),
            connected: comm.is_connected(),
            connection_type: comm.connection_type(),
            endpoint: comm.endpoint(),
            scheduler: self.scheduler.get().map(|s| s.stats()),
            hardware: self.get_hardware_info(),
            llm: self.ctx.cache.llm(),
        }
    }

    /// Tear down the transport. The scheduler keeps running and
    /// `initialize` may be called again. Idempotent.
    pub async fn cleanup(&self) {
        self.ctx.comm.disconnect().await;
        if self.initialized.swap(false, Ordering::AcqRel) {
            info!("Pathways cleaned up");
        }
    }

    /// Tear down the transport and stop the scheduler for good. Idempotent.
    pub async fn final_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cleanup().await;
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.shutdown();
        }
        self.ctx.comm.control().stop();
        info!("Pathways shut down");
    }
}
