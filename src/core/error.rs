//! Error types for transports, tasks and the scheduler.

use std::time::Duration;

use thiserror::Error;

/// Envelope error code for transport, command and parse failures.
pub const ERR_COMMAND: i64 = -1;
/// Envelope error code for a session that answered with nothing.
pub const ERR_EMPTY_RESPONSE: i64 = -2;

/// Errors produced while establishing or using a device session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// `transmit` was called without a live session.
    #[error("transport is not connected")]
    NotConnected,
    /// No complete frame arrived within the read budget.
    #[error("Timeout waiting for response after {0:?}")]
    Timeout(Duration),
    /// The device closed the exchange without sending a byte.
    #[error("Empty response")]
    EmptyResponse,
    /// The peer closed the session mid-frame.
    #[error("connection closed by device")]
    ConnectionClosed,
    /// A frame exceeded the maximum accepted length.
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    /// Socket or process I/O failure.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    /// Command serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// An `adb` invocation failed.
    #[error("adb error: {0}")]
    Adb(String),
    /// Serial port failure.
    #[error("serial error: {0}")]
    Serial(String),
    /// The netcat tunnel over the serial shell could not be brought up.
    #[error("tunnel error: {0}")]
    Tunnel(String),
    /// Unknown connection type string.
    #[error("unsupported connection type: {0}")]
    UnsupportedConnection(String),
}

impl TransportError {
    /// Envelope error code reported to callers for this failure.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::EmptyResponse => ERR_EMPTY_RESPONSE,
            _ => ERR_COMMAND,
        }
    }
}

/// Errors raised inside a task body. The scheduler stores them as
/// `{"error": message}` in the task result.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The device answered with a non-zero error code.
    #[error("device error {code}: {message}")]
    Device {
        /// Device error code.
        code: i64,
        /// Device error message.
        message: String,
    },
    /// The response did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// Relay target is not registered.
    #[error("unknown cortex: {0}")]
    UnknownCortex(String),
    /// A command task was scheduled without a command.
    #[error("no command to execute")]
    NoCommand,
    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// Transport failure surfaced through a task.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors produced by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task table is full.
    #[error("task capacity exceeded (max {max})")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Errors produced while loading or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O failure.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parse or encode failure.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
