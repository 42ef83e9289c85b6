//! `adb` process invocation.
//!
//! Bare `adb` from `PATH` is tried first. Once it cannot be spawned, the
//! configured path is used for every later call without retrying the bare
//! form.

use std::process::Output;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::error::TransportError;

/// Default budget for one adb invocation.
pub const ADB_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs adb subcommands and returns their stdout.
#[async_trait]
pub trait AdbRunner: Send + Sync {
    /// Run `adb <args>`.
    ///
    /// # Errors
    ///
    /// Returns an error if adb cannot be started, times out, or exits non-zero.
    async fn run(&self, args: &[&str]) -> Result<String, TransportError>;

    /// Run `adb shell <command>`.
    ///
    /// # Errors
    ///
    /// Same as [`AdbRunner::run`].
    async fn shell(&self, command: &str) -> Result<String, TransportError> {
        self.run(&["shell", command]).await
    }
}

/// [`AdbRunner`] backed by `tokio::process::Command`.
#[derive(Debug)]
pub struct AdbCommand {
    primary: String,
    configured: String,
    direct_failed: AtomicBool,
    timeout: Duration,
}

impl AdbCommand {
    /// Runner preferring bare `adb`, falling back to `configured_path`.
    pub fn new(configured_path: impl Into<String>) -> Self {
        Self {
            primary: "adb".to_string(),
            configured: configured_path.into(),
            direct_failed: AtomicBool::new(false),
            timeout: ADB_COMMAND_TIMEOUT,
        }
    }

    /// Replace the program tried first.
    #[must_use]
    pub fn with_primary(mut self, program: impl Into<String>) -> Self {
        self.primary = program.into();
        self
    }

    /// Replace the per-invocation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the bare program failed and the configured path is now used.
    #[must_use]
    pub fn uses_configured_path(&self) -> bool {
        self.direct_failed.load(Ordering::Acquire)
    }

    fn configured_program(&self) -> String {
        if cfg!(windows)
            && !self.configured.to_ascii_lowercase().ends_with(".exe")
            && self.configured != self.primary
        {
            format!("{}.exe", self.configured)
        } else {
            self.configured.clone()
        }
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<Output, TransportError> {
        debug!(program, args = %args.join(" "), "Running adb");
        let run = Command::new(program).args(args).kill_on_drop(true).output();
        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Adb(format!(
                "`adb {}` timed out after {:?}",
                args.join(" "),
                self.timeout
            ))),
        }
    }
}

fn finish(args: &[&str], output: &Output) -> Result<String, TransportError> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(TransportError::Adb(format!(
            "`adb {}` exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl AdbRunner for AdbCommand {
    async fn run(&self, args: &[&str]) -> Result<String, TransportError> {
        if !self.uses_configured_path() {
            match self.spawn(&self.primary, args).await {
                Ok(output) => return finish(args, &output),
                Err(TransportError::Io(e)) if self.configured != self.primary => {
                    warn!(
                        program = %self.primary,
                        fallback = %self.configured,
                        error = %e,
                        "adb not runnable, switching to configured path"
                    );
                    self.direct_failed.store(true, Ordering::Release);
                }
                Err(e) => return Err(e),
            }
        }
        let program = self.configured_program();
        let output = self.spawn(&program, args).await?;
        finish(args, &output)
    }
}

/// Serials listed as `device` (not `offline`/`unauthorized`) by `adb devices`.
#[must_use]
pub fn parse_device_serials(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            (fields.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_ignores_header_and_offline_entries() {
        let out = "List of devices attached\n\
                   emulator-5554\tdevice\n\
                   0123456789\toffline\n\
                   10.0.0.50:5555  device product:m5 model:LLM\n\n";
        assert_eq!(
            parse_device_serials(out),
            vec!["emulator-5554".to_string(), "10.0.0.50:5555".to_string()]
        );
        assert!(parse_device_serials("List of devices attached\n\n").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unspawnable_primary_switches_to_configured_path_once() {
        let adb = AdbCommand::new("/bin/echo").with_primary("/nonexistent/bin/adb");
        assert!(!adb.uses_configured_path());

        let out = adb.run(&["devices"]).await.unwrap();
        assert_eq!(out.trim(), "devices");
        assert!(adb.uses_configured_path());

        let out = adb.run(&["forward", "--list"]).await.unwrap();
        assert_eq!(out.trim(), "forward --list");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_exit_status_does_not_switch_programs() {
        let adb = AdbCommand::new("/bin/echo").with_primary("/bin/false");
        let err = adb.run(&["devices"]).await.unwrap_err();
        assert!(matches!(err, TransportError::Adb(_)));
        assert!(!adb.uses_configured_path());
    }
}
