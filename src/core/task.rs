//! Task lifecycle and the closed set of schedulable tasks.
//!
//! Every task owns a [`TaskControl`] carrying its identity, priority,
//! cadence and lifecycle state. [`NeuralTask`] is the sum type the scheduler
//! dispatches over; its [`run`](NeuralTask::run) is the firewall that turns
//! errors and panics inside a task body into a stored `{"error": ...}` result.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error};

use super::cache::DeviceCache;
use super::communication::CommunicationTask;
use super::error::TaskError;
use super::relay::CortexRegistry;
use super::tasks::{
    CortexRelayTask, DisplaySink, DisplaySinkTask, HardwareInfoTask, ModelManagementTask,
    SystemCommandTask, ThinkTask,
};
use crate::runtime::TokioSpawner;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Constructed but not yet eligible to run.
    Unstarted,
    /// Eligible to run on every due tick.
    Active,
    /// Temporarily skipped by the scheduler.
    Paused,
    /// Terminal. A completed task is never resumed.
    Completed,
}

/// Identity, scheduling parameters and lifecycle of one task.
#[derive(Debug)]
pub struct TaskControl {
    name: String,
    priority: i32,
    interval: Duration,
    created_at: Instant,
    state: Mutex<TaskState>,
    result: Mutex<Option<Value>>,
    running: AtomicBool,
    runs: AtomicU64,
    done: watch::Sender<bool>,
}

impl TaskControl {
    /// An active control block.
    pub fn new(name: impl Into<String>, priority: i32, interval: Duration) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            name: name.into(),
            priority,
            interval,
            created_at: Instant::now(),
            state: Mutex::new(TaskState::Active),
            result: Mutex::new(None),
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            done,
        }
    }

    /// Start in `Unstarted` instead of `Active`.
    #[must_use]
    pub fn unstarted(self) -> Self {
        *self.state.lock() = TaskState::Unstarted;
        self
    }

    /// Override the priority. Lower runs first.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the minimum interval between runs.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Lookup key in the scheduler.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority, lower first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Minimum time between two runs.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// When the task was constructed.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Whether the scheduler should consider this task.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }

    /// Whether the task has reached its terminal state.
    #[must_use]
    pub fn has_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Whether the body has executed at least once.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.runs() > 0
    }

    /// Number of finished executions.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// Whether an execution is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// `Active` to `Paused`. Returns whether the state changed.
    pub fn pause(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TaskState::Active {
            *state = TaskState::Paused;
            true
        } else {
            false
        }
    }

    /// `Unstarted` or `Paused` to `Active`. Returns whether the state changed.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            TaskState::Unstarted | TaskState::Paused => {
                *state = TaskState::Active;
                true
            }
            TaskState::Active | TaskState::Completed => false,
        }
    }

    /// Alias of [`resume`](Self::resume) used when a task first becomes runnable.
    pub fn activate(&self) -> bool {
        self.resume()
    }

    /// Move to `Completed` and wake every waiter. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state != TaskState::Completed {
            *state = TaskState::Completed;
            drop(state);
            self.done.send_replace(true);
            debug!(task = %self.name, "Task completed");
        }
    }

    /// Last stored result.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    /// Replace the stored result.
    pub fn set_result(&self, value: Value) {
        *self.result.lock() = Some(value);
    }

    /// Resolve once the task is `Completed`.
    pub async fn wait_completed(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// `"name (Priority: p, Active: a)"`.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} (Priority: {}, Active: {})",
            self.name,
            self.priority,
            self.is_active()
        )
    }

    fn begin_run(&self) -> Option<RunGuard<'_>> {
        if self.running.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(RunGuard { control: self })
        }
    }
}

/// Clears the re-entrancy flag and counts the run when dropped.
struct RunGuard<'a> {
    control: &'a TaskControl,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.control.runs.fetch_add(1, Ordering::AcqRel);
        self.control.running.store(false, Ordering::Release);
    }
}

/// Shared handles every task body may use.
#[derive(Clone)]
pub struct TaskContext {
    /// The only path to the device.
    pub comm: Arc<CommunicationTask>,
    /// Last-known device state.
    pub cache: Arc<DeviceCache>,
    /// Registered cortex endpoints.
    pub cortices: Arc<CortexRegistry>,
    /// Where display frames go.
    pub display: Arc<dyn DisplaySink>,
    /// Runs background jobs such as LLM calls.
    pub spawner: TokioSpawner,
}

/// What happened when the scheduler invoked a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The body ran and returned normally.
    Ran,
    /// The body returned an error or panicked.
    Failed(String),
    /// Not active, or a previous run is still in progress.
    Skipped,
}

/// Every kind of task the scheduler can run.
#[derive(Clone)]
pub enum NeuralTask {
    /// Owner of the device transport.
    Communication(Arc<CommunicationTask>),
    /// Periodic `hwinfo` poll.
    HardwareInfo(Arc<HardwareInfoTask>),
    /// One `sys` command.
    SystemCommand(Arc<SystemCommandTask>),
    /// Periodic model listing.
    ModelManagement(Arc<ModelManagementTask>),
    /// One LLM inference.
    Think(Arc<ThinkTask>),
    /// One payload relayed between cortices.
    CortexRelay(Arc<CortexRelayTask>),
    /// Text or LLM stream rendering.
    DisplaySink(Arc<DisplaySinkTask>),
}

impl NeuralTask {
    /// Lifecycle block of the wrapped task.
    #[must_use]
    pub fn control(&self) -> &TaskControl {
        match self {
            Self::Communication(t) => t.control(),
            Self::HardwareInfo(t) => t.control(),
            Self::SystemCommand(t) => t.control(),
            Self::ModelManagement(t) => t.control(),
            Self::Think(t) => t.control(),
            Self::CortexRelay(t) => t.control(),
            Self::DisplaySink(t) => t.control(),
        }
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.control().name()
    }

    /// Variant label used in logs and history.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Communication(_) => "communication",
            Self::HardwareInfo(_) => "hardware_info",
            Self::SystemCommand(_) => "system_command",
            Self::ModelManagement(_) => "model_management",
            Self::Think(_) => "think",
            Self::CortexRelay(_) => "cortex_relay",
            Self::DisplaySink(_) => "display_sink",
        }
    }

    /// Tasks `run` stops after a single execution.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        match self {
            Self::SystemCommand(_) | Self::CortexRelay(_) => true,
            Self::DisplaySink(t) => !t.is_stream(),
            Self::Communication(_)
            | Self::HardwareInfo(_)
            | Self::ModelManagement(_)
            | Self::Think(_) => false,
        }
    }

    /// Tasks that are expected to stay active indefinitely.
    #[must_use]
    pub const fn is_perpetual(&self) -> bool {
        matches!(
            self,
            Self::Communication(_) | Self::HardwareInfo(_) | Self::ModelManagement(_)
        )
    }

    /// Run the task body once.
    ///
    /// # Errors
    ///
    /// Whatever the body reports. [`run`](Self::run) is the caller that
    /// stores those errors instead of propagating them.
    pub async fn execute(&self, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        match self {
            Self::Communication(t) => Ok(Some(t.status())),
            Self::HardwareInfo(t) => t.execute(ctx).await,
            Self::SystemCommand(t) => t.execute(ctx).await,
            Self::ModelManagement(t) => t.execute(ctx).await,
            Self::Think(t) => t.dispatch(ctx),
            Self::CortexRelay(t) => t.execute(ctx).await,
            Self::DisplaySink(t) => t.execute(ctx),
        }
    }

    /// Scheduler entry point. Never fails: errors and panics become a stored
    /// `{"error": message}` result, and one-shot tasks are stopped either way.
    pub async fn run(&self, ctx: &TaskContext) -> RunOutcome {
        let control = self.control();
        if !control.is_active() {
            return RunOutcome::Skipped;
        }
        let Some(guard) = control.begin_run() else {
            debug!(task = %control.name(), "Previous run still in progress");
            return RunOutcome::Skipped;
        };

        let caught = AssertUnwindSafe(self.execute(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));
        let outcome = match caught {
            Ok(value) => {
                if let Some(value) = value {
                    control.set_result(value);
                }
                RunOutcome::Ran
            }
            Err(e) => {
                error!(task = %control.name(), kind = self.kind(), error = %e, "Task failed");
                let message = e.to_string();
                control.set_result(json!({ "error": message }));
                RunOutcome::Failed(message)
            }
        };
        drop(guard);

        if self.is_one_shot() {
            control.stop();
        }
        outcome
    }
}

impl From<Arc<CommunicationTask>> for NeuralTask {
    fn from(task: Arc<CommunicationTask>) -> Self {
        Self::Communication(task)
    }
}

impl From<Arc<HardwareInfoTask>> for NeuralTask {
    fn from(task: Arc<HardwareInfoTask>) -> Self {
        Self::HardwareInfo(task)
    }
}

impl From<Arc<SystemCommandTask>> for NeuralTask {
    fn from(task: Arc<SystemCommandTask>) -> Self {
        Self::SystemCommand(task)
    }
}

impl From<Arc<ModelManagementTask>> for NeuralTask {
    fn from(task: Arc<ModelManagementTask>) -> Self {
        Self::ModelManagement(task)
    }
}

impl From<Arc<ThinkTask>> for NeuralTask {
    fn from(task: Arc<ThinkTask>) -> Self {
        Self::Think(task)
    }
}

impl From<Arc<CortexRelayTask>> for NeuralTask {
    fn from(task: Arc<CortexRelayTask>) -> Self {
        Self::CortexRelay(task)
    }
}

impl From<Arc<DisplaySinkTask>> for NeuralTask {
    fn from(task: Arc<DisplaySinkTask>) -> Self {
        Self::DisplaySink(task)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
