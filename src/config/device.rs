//! Device connection configuration.

use serde::{Deserialize, Serialize};

use crate::transport::ConnectionType;

/// Direct TCP/WiFi endpoint of the device's LLM service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmServiceConfig {
    /// Last known device IP.
    pub ip: String,
    /// Service port.
    pub port: u16,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-request read timeout in seconds.
    pub response_timeout_secs: u64,
}

impl Default for LlmServiceConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.10".to_string(),
            port: 10001,
            connect_timeout_secs: 5,
            response_timeout_secs: 5,
        }
    }
}

/// Serial link settings. The link is always 8N1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name, or `auto` to pick the first port that looks like the device.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Time given to each tunnel bootstrap shell step, in milliseconds.
    pub settle_delay_ms: u64,
    /// Per-request read timeout in seconds.
    pub response_timeout_secs: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "auto".to_string(),
            baud_rate: 115_200,
            settle_delay_ms: 500,
            response_timeout_secs: 5,
        }
    }
}

/// ADB forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbSettings {
    /// Configured adb executable, used once bare `adb` has failed.
    pub path: String,
    /// Host-side forwarded port.
    pub local_port: u16,
    /// Device-side service port.
    pub remote_port: u16,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            path: "adb".to_string(),
            local_port: 10001,
            remote_port: 10001,
        }
    }
}

/// Which transport to start with and what to try when it fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPolicy {
    /// Transport used when none is requested explicitly.
    pub default_type: ConnectionType,
    /// Transports tried in order after the requested one fails.
    pub fallback: Vec<ConnectionType>,
    /// Upper bound on fallback attempts per `initialize`.
    pub max_fallback_attempts: usize,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            default_type: ConnectionType::Tcp,
            fallback: vec![ConnectionType::Adb],
            max_fallback_attempts: 1,
        }
    }
}

/// Everything transports need to reach the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// TCP/WiFi endpoint.
    pub llm_service: LlmServiceConfig,
    /// Serial link.
    pub serial: SerialSettings,
    /// ADB forwarding.
    pub adb: AdbSettings,
    /// Connection selection policy.
    pub connection: ConnectionPolicy,
}

impl DeviceConfig {
    /// Validate device configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.llm_service.ip.trim().is_empty() {
            return Err("llm_service.ip must not be empty".into());
        }
        if self.llm_service.port == 0 {
            return Err("llm_service.port must be greater than 0".into());
        }
        if self.llm_service.connect_timeout_secs == 0 || self.llm_service.response_timeout_secs == 0
        {
            return Err("llm_service timeouts must be greater than 0".into());
        }
        if self.serial.baud_rate == 0 {
            return Err("serial.baud_rate must be greater than 0".into());
        }
        if self.serial.port.trim().is_empty() {
            return Err("serial.port must not be empty (use `auto` to detect)".into());
        }
        if self.adb.path.trim().is_empty() {
            return Err("adb.path must not be empty".into());
        }
        if self.adb.local_port == 0 || self.adb.remote_port == 0 {
            return Err("adb ports must be greater than 0".into());
        }
        Ok(())
    }
}
