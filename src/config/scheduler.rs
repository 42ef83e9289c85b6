//! Scheduler, cadence and wait-budget configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum interval between runs, per task family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// Hardware polling.
    pub hardware_info_secs: u64,
    /// Model listing.
    pub model_management_secs: u64,
    /// System commands (effectively every tick).
    pub system_command_ms: u64,
    /// Everything else.
    pub default_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            hardware_info_secs: 60,
            model_management_secs: 120,
            system_command_ms: 100,
            default_ms: 1000,
        }
    }
}

impl CadenceConfig {
    /// Hardware polling interval.
    #[must_use]
    pub const fn hardware_info(&self) -> Duration {
        Duration::from_secs(self.hardware_info_secs)
    }

    /// Model listing interval.
    #[must_use]
    pub const fn model_management(&self) -> Duration {
        Duration::from_secs(self.model_management_secs)
    }

    /// System command interval.
    #[must_use]
    pub const fn system_command(&self) -> Duration {
        Duration::from_millis(self.system_command_ms)
    }

    /// Interval of every other task.
    #[must_use]
    pub const fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }
}

/// Stale-task cleanup policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How often the cleanup pass runs.
    pub interval_secs: u64,
    /// Inactive tasks older than this are dropped.
    pub inactive_ttl_secs: u64,
    /// One-shot tasks still active after this are force-stopped.
    pub hung_ttl_secs: u64,
    /// Removed-task history kept for stats.
    pub max_history: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            inactive_ttl_secs: 300,
            hung_ttl_secs: 600,
            max_history: 20,
        }
    }
}

/// Connection monitor policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often the monitor wakes.
    pub interval_secs: u64,
    /// Idle time after which a ping is sent.
    pub idle_threshold_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_threshold_secs: 300,
        }
    }
}

/// Outer timeouts for façade calls that wait on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Wait for one-shot command tasks.
    pub task_timeout_ms: u64,
    /// Wait for a think task.
    pub think_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: 5000,
            think_timeout_secs: 60,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between ticks.
    pub tick_interval_ms: u64,
    /// Sleep after a failed cycle.
    pub error_backoff_ms: u64,
    /// Maximum registered tasks.
    pub max_tasks: usize,
    /// Per-family cadences.
    pub cadence: CadenceConfig,
    /// Cleanup policy.
    pub cleanup: CleanupConfig,
    /// Connection monitor.
    pub monitor: MonitorConfig,
    /// Façade wait budgets.
    pub wait: WaitConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            error_backoff_ms: 1000,
            max_tasks: 16,
            cadence: CadenceConfig::default(),
            cleanup: CleanupConfig::default(),
            monitor: MonitorConfig::default(),
            wait: WaitConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Builder: tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder: maximum registered tasks.
    #[must_use]
    pub const fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Sleep between ticks.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Sleep after a failed cycle.
    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Validate scheduler configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        if self.max_tasks == 0 {
            return Err("max_tasks must be greater than 0".into());
        }
        if self.cleanup.max_history == 0 {
            return Err("cleanup.max_history must be greater than 0".into());
        }
        if self.cleanup.hung_ttl_secs < self.cleanup.inactive_ttl_secs {
            return Err("cleanup.hung_ttl_secs must not be shorter than inactive_ttl_secs".into());
        }
        if self.monitor.interval_secs == 0 {
            return Err("monitor.interval_secs must be greater than 0".into());
        }
        if self.wait.task_timeout_ms == 0 || self.wait.think_timeout_secs == 0 {
            return Err("wait timeouts must be greater than 0".into());
        }
        Ok(())
    }
}
