//! The BasalGanglia scheduler.
//!
//! A cooperative polling loop: every tick walks the task table in ascending
//! priority and runs each active task whose own interval has elapsed since
//! its last run. Task bodies are firewalled by [`NeuralTask::run`], so one
//! failing task never stops the tick.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::audit::{AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
use super::error::SchedulerError;
use super::task::{NeuralTask, RunOutcome, TaskContext};
use crate::config::SchedulerConfig;
use crate::util::clock::now_ms;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks that ran, in invocation order.
    pub ran: Vec<String>,
    /// Tasks whose run failed, in invocation order.
    pub failed: Vec<String>,
    /// Due tasks that were skipped (inactive or still running).
    pub skipped: usize,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks in `Active` state.
    pub active: usize,
    /// Registered tasks not in `Active` state.
    pub inactive: usize,
    /// Registered tasks.
    pub total: usize,
    /// Retained removal events.
    pub history: usize,
    /// Wall-clock milliseconds of the last cleanup pass.
    pub last_cleanup_ms: Option<u128>,
    /// Ticks executed.
    pub ticks: u64,
}

/// Priority-ordered, cadence-gated executor of registered tasks.
pub struct BasalGanglia {
    config: SchedulerConfig,
    ctx: TaskContext,
    tasks: Mutex<Vec<NeuralTask>>,
    last_execution: Mutex<HashMap<String, Instant>>,
    last_cleanup: Mutex<Instant>,
    last_cleanup_ms: Mutex<Option<u128>>,
    history: Mutex<InMemoryAuditSink>,
    ticks: AtomicU64,
    running: AtomicBool,
    shut_down: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BasalGanglia {
    /// Scheduler running tasks against `ctx`.
    #[must_use]
    pub fn new(config: SchedulerConfig, ctx: TaskContext) -> Self {
        let history = InMemoryAuditSink::new(config.cleanup.max_history);
        Self {
            config,
            ctx,
            tasks: Mutex::new(Vec::new()),
            last_execution: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
            last_cleanup_ms: Mutex::new(None),
            history: Mutex::new(history),
            ticks: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    /// Context handed to every task.
    #[must_use]
    pub const fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add `task`, or replace the registered task with the same name.
    /// The table is kept sorted by priority; equal priorities keep
    /// registration order.
    ///
    /// # Errors
    ///
    /// `ShutDown` after [`shutdown`](Self::shutdown), `CapacityExceeded` if a
    /// new name would exceed `max_tasks`.
    pub fn register_task(&self, task: impl Into<NeuralTask>) -> Result<(), SchedulerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let task = task.into();
        let name = task.name().to_string();
        let kind = task.kind();
        let priority = task.control().priority();

        let action = {
            let mut tasks = self.tasks.lock();
            let action = match tasks.iter().position(|t| t.name() == name) {
                Some(index) => {
                    tasks[index] = task;
                    AuditAction::Replaced
                }
                None if tasks.len() >= self.config.max_tasks => {
                    warn!(task = %name, max = self.config.max_tasks, "Task table full");
                    return Err(SchedulerError::CapacityExceeded {
                        max: self.config.max_tasks,
                    });
                }
                None => {
                    tasks.push(task);
                    AuditAction::Registered
                }
            };
            tasks.sort_by_key(|t| t.control().priority());
            action
        };
        if action == AuditAction::Replaced {
            self.last_execution.lock().remove(&name);
        }
        self.history.lock().record(AuditEvent::new(name.clone(), kind, action));
        debug!(task = %name, kind, priority, ?action, "Task registered");
        Ok(())
    }

    /// Registered task called `name`.
    #[must_use]
    pub fn get_task(&self, name: &str) -> Option<NeuralTask> {
        self.tasks.lock().iter().find(|t| t.name() == name).cloned()
    }

    /// Task names in execution order.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|t| t.name().to_string()).collect()
    }

    /// `describe()` of every task, in execution order.
    #[must_use]
    pub fn describe_tasks(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|t| t.control().describe()).collect()
    }

    /// Remove `name` without recording history. Returns whether it existed.
    pub fn unregister_task(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| t.name() != name);
        let removed = tasks.len() != before;
        drop(tasks);
        if removed {
            self.last_execution.lock().remove(name);
        }
        removed
    }

    /// Run every active, due task once, as of `now`.
    pub async fn tick_at(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        if self.shut_down.load(Ordering::Acquire) {
            return report;
        }
        let due: Vec<NeuralTask> = {
            let tasks = self.tasks.lock();
            let last = self.last_execution.lock();
            tasks
                .iter()
                .filter(|t| t.control().is_active())
                .filter(|t| {
                    last.get(t.name()).map_or(true, |prev| {
                        now.saturating_duration_since(*prev) >= t.control().interval()
                    })
                })
                .cloned()
                .collect()
        };

        for task in due {
            match task.run(&self.ctx).await {
                RunOutcome::Ran => report.ran.push(task.name().to_string()),
                RunOutcome::Failed(_) => {
                    report.ran.push(task.name().to_string());
                    report.failed.push(task.name().to_string());
                }
                RunOutcome::Skipped => {
                    report.skipped += 1;
                    continue;
                }
            }
            self.last_execution.lock().insert(task.name().to_string(), now);
        }
        self.ticks.fetch_add(1, Ordering::AcqRel);
        report
    }

    /// One loop iteration: cleanup when due, then a tick.
    pub async fn run_cycle(&self) -> TickReport {
        let now = Instant::now();
        let cleanup_due = {
            let last = *self.last_cleanup.lock();
            now.saturating_duration_since(last) >= Duration::from_secs(self.config.cleanup.interval_secs)
        };
        if cleanup_due {
            self.cleanup_at(now);
        }
        self.tick_at(now).await
    }

    /// Drop completed tasks, long-inactive tasks, and one-shot tasks stuck
    /// active past the hung threshold (those are stopped first). Returns the
    /// number removed.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let inactive_ttl = Duration::from_secs(self.config.cleanup.inactive_ttl_secs);
        let hung_ttl = Duration::from_secs(self.config.cleanup.hung_ttl_secs);
        let mut removed = Vec::new();
        self.tasks.lock().retain(|task| {
            let control = task.control();
            let age = now.saturating_duration_since(control.created_at());
            let action = if control.has_completed() {
                Some(AuditAction::RemovedCompleted)
            } else if !control.is_active() && age >= inactive_ttl {
                Some(AuditAction::RemovedInactive)
            } else if control.is_active() && !task.is_perpetual() && age >= hung_ttl {
                control.stop();
                Some(AuditAction::RemovedHung)
            } else {
                None
            };
            match action {
                Some(action) => {
                    removed.push(AuditEvent::new(task.name(), task.kind(), action));
                    false
                }
                None => true,
            }
        });

        {
            let mut last = self.last_execution.lock();
            let mut history = self.history.lock();
            for event in &removed {
                last.remove(&event.task);
                if event.action == AuditAction::RemovedHung {
                    warn!(task = %event.task, kind = event.kind, "Force-stopped hung task");
                }
                history.record(event.clone());
            }
        }
        *self.last_cleanup.lock() = now;
        *self.last_cleanup_ms.lock() = Some(now_ms());
        if !removed.is_empty() {
            info!(removed = removed.len(), "Cleaned up stale tasks");
        }
        removed.len()
    }

    /// Retained audit events, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<AuditEvent> {
        self.history.lock().events()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let (active, total) = {
            let tasks = self.tasks.lock();
            (tasks.iter().filter(|t| t.control().is_active()).count(), tasks.len())
        };
        SchedulerStats {
            active,
            inactive: total - active,
            total,
            history: self.history.lock().removals(),
            last_cleanup_ms: *self.last_cleanup_ms.lock(),
            ticks: self.ticks(),
        }
    }

    /// Ticks executed so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Whether the background loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Spawn the background loop on the current tokio runtime.
    ///
    /// Returns `false` if it is already running, the scheduler was shut
    /// down, or there is no runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.is_shut_down() || self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, scheduler loop not started");
            self.running.store(false, Ordering::Release);
            return false;
        };
        let weak = Arc::downgrade(self);
        *self.loop_handle.lock() = Some(runtime.spawn(task_loop(weak)));
        info!(
            tick_ms = self.config.tick_interval_ms,
            tasks = self.tasks.lock().len(),
            "Scheduler started"
        );
        true
    }

    /// Stop the loop, cancelling it at its current await point. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.loop_handle.lock().take() {
            handle.abort();
        }
        info!(ticks = self.ticks(), "Scheduler shut down");
    }
}

impl Drop for BasalGanglia {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

async fn task_loop(scheduler: Weak<BasalGanglia>) {
    loop {
        let Some(this) = scheduler.upgrade() else {
            break;
        };
        if !this.is_running() {
            break;
        }
        let pause = match AssertUnwindSafe(this.run_cycle()).catch_unwind().await {
            Ok(_) => this.config.tick_interval(),
            Err(_) => {
                error!("Scheduler cycle failed, backing off");
                this.config.error_backoff()
            }
        };
        drop(this);
        tokio::time::sleep(pause).await;
    }
    debug!("Scheduler loop exited");
}
