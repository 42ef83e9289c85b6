//! Configuration structures and loading.
//!
//! Configuration is read once at startup from an optional JSON file plus
//! environment overrides (a `.env` file is honoured through `dotenvy`). The
//! device section is then shared through [`SharedConfig`] so transports can
//! persist a rediscovered device IP.

pub mod device;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub use device::{AdbSettings, ConnectionPolicy, DeviceConfig, LlmServiceConfig, SerialSettings};
pub use scheduler::{CadenceConfig, CleanupConfig, MonitorConfig, SchedulerConfig, WaitConfig};

use crate::core::error::ConfigError;

/// Env var naming the JSON config file.
pub const ENV_CONFIG_PATH: &str = "BASAL_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathwaysConfig {
    /// Device and transport settings.
    pub device: DeviceConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
}

impl PathwaysConfig {
    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns the first section error, prefixed with the section name.
    pub fn validate(&self) -> Result<(), String> {
        self.device
            .validate()
            .map_err(|e| format!("device config invalid: {e}"))?;
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler config invalid: {e}"))
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read configuration from a JSON file. Missing sections take defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` or `ConfigError::Parse`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load `.env`, the file named by `BASAL_CONFIG` (if any) and env
    /// overrides, then validate. Returns the config and the file it came from.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or a value is invalid.
    pub fn from_env() -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env");
        }
        let path = std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from);
        let mut cfg = match &path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate().map_err(ConfigError::Invalid)?;
        Ok((cfg, path))
    }

    /// Apply `BASAL_*` environment overrides on top of the current values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when a variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let device = &mut self.device;
        if let Some(ip) = env_value::<String>("BASAL_DEVICE_IP")? {
            device.llm_service.ip = ip;
        }
        if let Some(port) = env_value("BASAL_DEVICE_PORT")? {
            device.llm_service.port = port;
        }
        if let Some(port) = env_value::<String>("BASAL_SERIAL_PORT")? {
            device.serial.port = port;
        }
        if let Some(baud) = env_value("BASAL_SERIAL_BAUD")? {
            device.serial.baud_rate = baud;
        }
        if let Some(path) = env_value::<String>("BASAL_ADB_PATH")? {
            device.adb.path = path;
        }
        if let Some(kind) = env_value("BASAL_CONNECTION")? {
            device.connection.default_type = kind;
        }
        Ok(())
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Device configuration shared between transports, with write-back to the
/// file it was loaded from.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    device: Arc<RwLock<DeviceConfig>>,
    path: Option<Arc<PathBuf>>,
}

impl SharedConfig {
    /// Share an in-memory device config with no backing file.
    #[must_use]
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device: Arc::new(RwLock::new(device)),
            path: None,
        }
    }

    /// Remember the file updates are written back to.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(Arc::new(path.into()));
        self
    }

    /// Snapshot of the current device config.
    #[must_use]
    pub fn device(&self) -> DeviceConfig {
        self.device.read().clone()
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Record a newly discovered device IP and write it to the backing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be read or written; the
    /// in-memory value is updated either way.
    pub fn persist_device_ip(&self, ip: &str) -> Result<(), ConfigError> {
        self.device.write().llm_service.ip = ip.to_string();
        let Some(path) = self.path() else {
            return Ok(());
        };
        let mut doc = if path.exists() {
            serde_json::from_str::<Value>(&std::fs::read_to_string(path)?)?
        } else {
            serde_json::json!({})
        };
        let device = serde_json::to_value(&*self.device.read())?;
        match doc.as_object_mut() {
            Some(root) => {
                let entry = root.entry("device").or_insert_with(|| device.clone());
                if let Some(service) = entry
                    .as_object_mut()
                    .map(|d| d.entry("llm_service").or_insert_with(|| serde_json::json!({})))
                    .and_then(Value::as_object_mut)
                {
                    service.insert("ip".into(), Value::String(ip.to_string()));
                }
            }
            None => return Err(ConfigError::Invalid(format!("{} is not a JSON object", path.display()))),
        }
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
        info!(ip, path = %path.display(), "Persisted device IP");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PathwaysConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = PathwaysConfig::from_json_str(
            r#"{"device": {"llm_service": {"ip": "10.0.0.7"}}, "scheduler": {"tick_interval_ms": 50}}"#,
        )
        .unwrap();
        assert_eq!(cfg.device.llm_service.ip, "10.0.0.7");
        assert_eq!(cfg.device.llm_service.port, 10001);
        assert_eq!(cfg.scheduler.tick_interval_ms, 50);
        assert_eq!(cfg.scheduler.cadence.hardware_info_secs, 60);
    }

    #[test]
    fn invalid_values_are_reported_with_section() {
        let err = PathwaysConfig::from_json_str(r#"{"scheduler": {"max_tasks": 0}}"#).unwrap_err();
        assert!(err.contains("scheduler config invalid"));
        let err = PathwaysConfig::from_json_str(r#"{"device": {"serial": {"baud_rate": 0}}}"#)
            .unwrap_err();
        assert!(err.contains("baud_rate"));
    }

    #[test]
    fn persisted_ip_is_written_back() {
        let dir = std::env::temp_dir().join(format!("basal-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"device": {"llm_service": {"ip": "1.2.3.4", "port": 10001}}, "extra": true}"#)
            .unwrap();

        let shared = SharedConfig::new(DeviceConfig::default()).with_path(&path);
        shared.persist_device_ip("10.0.0.50").unwrap();

        assert_eq!(shared.device().llm_service.ip, "10.0.0.50");
        let reloaded = PathwaysConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.device.llm_service.ip, "10.0.0.50");
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["extra"], true);
        std::fs::remove_dir_all(&dir).ok();
    }
}
