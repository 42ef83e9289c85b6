//! Last-known device state shared between tasks and the façade.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::DEFAULT_LLM_WORK_ID;
use super::error::TaskError;

/// Hardware readings from `sys`/`hwinfo`. `None` means not yet known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// CPU load.
    pub cpu_loadavg: Option<f64>,
    /// Memory usage.
    pub mem: Option<f64>,
    /// Temperature as reported by the device.
    pub temperature: Option<f64>,
    /// Unix seconds of the reading.
    pub timestamp: Option<i64>,
}

impl HardwareSnapshot {
    /// Read the fields out of an `hwinfo` response payload.
    ///
    /// # Errors
    ///
    /// `InvalidResponse` if `data` is not an object.
    pub fn from_data(data: &Value, timestamp: i64) -> Result<Self, TaskError> {
        let Some(fields) = data.as_object() else {
            return Err(TaskError::InvalidResponse(format!(
                "hwinfo payload is not an object: {data}"
            )));
        };
        Ok(Self {
            cpu_loadavg: number(fields, "cpu_loadavg"),
            mem: number(fields, "mem"),
            temperature: number(fields, "temperature"),
            timestamp: Some(timestamp),
        })
    }

    /// One-line summary, `N/A` for unknown fields.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "CPU: {} | Memory: {} | Temp: {} | Updated: {}",
            or_na(self.cpu_loadavg),
            or_na(self.mem),
            or_na(self.temperature),
            self.timestamp.map_or_else(|| "N/A".to_string(), clock_utc),
        )
    }
}

fn number(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn or_na(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| v.to_string())
}

fn clock_utc(secs: i64) -> String {
    let day = secs.rem_euclid(86_400);
    format!(
        "{:02}:{:02}:{:02} UTC",
        day / 3600,
        (day % 3600) / 60,
        day % 60
    )
}

/// One entry of the `lsmode` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier.
    #[serde(default)]
    pub model: String,
    /// Unit type, e.g. `llm`, `tts`, `asr`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<Value>,
    /// Any other fields the device reports.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelInfo {
    /// Whether this is an LLM unit.
    #[must_use]
    pub fn is_llm(&self) -> bool {
        self.kind.eq_ignore_ascii_case("llm")
    }
}

/// Which LLM is loaded and under which work id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmSelection {
    /// First LLM in the latest listing.
    pub default_model: Option<String>,
    /// Model set up through `llm.setup`.
    pub active_model: Option<String>,
    /// Work id returned by `llm.setup`.
    pub work_id: Option<String>,
}

/// Cached hardware, model and LLM state.
#[derive(Debug, Default)]
pub struct DeviceCache {
    hardware: RwLock<HardwareSnapshot>,
    models: RwLock<Vec<ModelInfo>>,
    llm: RwLock<LlmSelection>,
}

impl DeviceCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last hardware snapshot.
    #[must_use]
    pub fn hardware(&self) -> HardwareSnapshot {
        self.hardware.read().clone()
    }

    /// Replace the hardware snapshot.
    pub fn set_hardware(&self, snapshot: HardwareSnapshot) {
        *self.hardware.write() = snapshot;
    }

    /// Last model listing.
    #[must_use]
    pub fn models(&self) -> Vec<ModelInfo> {
        self.models.read().clone()
    }

    /// Replace the listing and pick the first LLM as default.
    pub fn set_models(&self, models: Vec<ModelInfo>) {
        let default = models.iter().find(|m| m.is_llm()).map(|m| m.model.clone());
        *self.models.write() = models;
        if default.is_some() {
            self.llm.write().default_model = default;
        }
    }

    /// LLM selection snapshot.
    #[must_use]
    pub fn llm(&self) -> LlmSelection {
        self.llm.read().clone()
    }

    /// Work id to address inference requests to.
    #[must_use]
    pub fn llm_work_id(&self) -> String {
        self.llm
            .read()
            .work_id
            .clone()
            .unwrap_or_else(|| DEFAULT_LLM_WORK_ID.to_string())
    }

    /// Record a model set up under `work_id`.
    pub fn set_active_model(&self, model: impl Into<String>, work_id: impl Into<String>) {
        let mut llm = self.llm.write();
        llm.active_model = Some(model.into());
        llm.work_id = Some(work_id.into());
    }

    /// Forget the active model after a reset.
    pub fn clear_active_model(&self) {
        let mut llm = self.llm.write();
        llm.active_model = None;
        llm.work_id = None;
    }
}
