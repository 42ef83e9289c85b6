//! Command and response envelopes exchanged with the device.
//!
//! Every request is a single JSON object
//! `{request_id, work_id, action, object, data}` terminated by one newline.
//! The device answers with one line mirroring `request_id`/`work_id` and
//! carrying `error: {code, message}` where `code == 0` means success.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::TransportError;
use crate::util::{now_ms, now_secs, request_id};

/// Placeholder the device expects when a command carries no object tag.
pub const NONE_OBJECT: &str = "None";
/// Work id of the device's system unit.
pub const SYS_WORK_ID: &str = "sys";
/// Work id used for the LLM unit until a setup call returns a concrete one.
pub const DEFAULT_LLM_WORK_ID: &str = "llm";
/// Object tag of a plain-text inference request.
pub const LLM_TEXT_OBJECT: &str = "llm.utf-8";
/// Object tag of a streaming inference request.
pub const LLM_STREAM_OBJECT: &str = "llm.utf-8.stream";

/// A request sent to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation id echoed back by the device.
    pub request_id: String,
    /// Logical unit on the device (`sys`, `llm`, ...).
    pub work_id: String,
    /// Verb to perform.
    pub action: String,
    /// Object/type tag, `"None"` when unused.
    #[serde(default = "none_object")]
    pub object: String,
    /// Payload, `null` when unused.
    #[serde(default)]
    pub data: Value,
}

fn none_object() -> String {
    NONE_OBJECT.to_string()
}

impl CommandEnvelope {
    /// Create a command with a generated request id, no object and no data.
    pub fn new(work_id: impl Into<String>, action: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            request_id: request_id(&action),
            work_id: work_id.into(),
            action,
            object: none_object(),
            data: Value::Null,
        }
    }

    /// Set the object tag.
    #[must_use]
    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = object.into();
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Override the generated request id.
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// `sys`/`ping` liveness probe.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(SYS_WORK_ID, "ping")
    }

    /// `sys`/`hwinfo` hardware snapshot request.
    #[must_use]
    pub fn hwinfo() -> Self {
        Self::new(SYS_WORK_ID, "hwinfo")
    }

    /// `sys`/`lsmode` model listing request.
    #[must_use]
    pub fn list_models() -> Self {
        Self::new(SYS_WORK_ID, "lsmode")
    }

    /// `sys`/`reboot`.
    #[must_use]
    pub fn reboot() -> Self {
        Self::new(SYS_WORK_ID, "reboot")
    }

    /// `sys`/`reset`, which unloads every LLM unit.
    #[must_use]
    pub fn reset() -> Self {
        Self::new(SYS_WORK_ID, "reset")
    }

    /// A system command with the `system` object tag and a timestamped request id.
    #[must_use]
    pub fn system(action: &str, data: Value) -> Self {
        Self::new(SYS_WORK_ID, action)
            .with_request_id(format!("{action}_{}", now_ms()))
            .with_object("system")
            .with_data(data)
    }

    /// LLM inference request. Streaming requests wrap the prompt in a single
    /// finished delta.
    #[must_use]
    pub fn inference(work_id: &str, prompt: &str, stream: bool) -> Self {
        let cmd = Self::new(work_id, "inference");
        if stream {
            cmd.with_object(LLM_STREAM_OBJECT)
                .with_data(json!({"delta": prompt, "index": 0, "finish": true}))
        } else {
            cmd.with_object(LLM_TEXT_OBJECT)
                .with_data(Value::String(prompt.to_string()))
        }
    }

    /// LLM unit setup request selecting a model.
    #[must_use]
    pub fn llm_setup(setup: &LlmSetup) -> Self {
        Self::new(DEFAULT_LLM_WORK_ID, "setup")
            .with_object("llm.setup")
            .with_data(serde_json::to_value(setup).unwrap_or(Value::Null))
    }
}

/// Parameters of an `llm.setup` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSetup {
    /// Model to load.
    pub model: String,
    /// Output format.
    pub response_format: String,
    /// Input format.
    pub input: String,
    /// Enable output.
    pub enoutput: bool,
    /// Enable keyword spotting input.
    pub enkws: bool,
    /// Maximum generated tokens.
    pub max_token_len: u32,
    /// System prompt.
    pub prompt: String,
}

impl LlmSetup {
    /// Defaults the device ships with for a text-in, text-out assistant.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            response_format: LLM_TEXT_OBJECT.to_string(),
            input: LLM_TEXT_OBJECT.to_string(),
            enoutput: true,
            enkws: false,
            max_token_len: 127,
            prompt: "You are a helpful assistant named Penphin.".to_string(),
        }
    }
}

/// Error block of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Zero on success.
    #[serde(default = "missing_code")]
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

const fn missing_code() -> i64 {
    super::error::ERR_COMMAND
}

/// A response received from the device, or synthesized locally on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Mirrored correlation id.
    #[serde(default)]
    pub request_id: String,
    /// Mirrored work id.
    #[serde(default)]
    pub work_id: String,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Error block; absent means failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Object tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    /// Creation time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

impl ResponseEnvelope {
    /// Build a local error envelope for a request that did not get a valid answer.
    pub fn failure(request: &CommandEnvelope, code: i64, message: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            work_id: request.work_id.clone(),
            data: Value::Null,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
            object: Some(request.object.clone()),
            created: Some(now_secs()),
        }
    }

    /// Error envelope for a transport failure.
    #[must_use]
    pub fn from_transport_error(request: &CommandEnvelope, err: &TransportError) -> Self {
        Self::failure(request, err.code(), err.to_string())
    }

    /// Whether the device reported success (`error.code == 0`).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.code == 0)
    }

    /// Error code, `-1` when the error block is missing.
    #[must_use]
    pub fn error_code(&self) -> i64 {
        self.error.as_ref().map_or(missing_code(), |e| e.code)
    }

    /// Error message, empty when absent.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_ref().map_or("", |e| e.message.as_str())
    }

    /// JSON form of the envelope.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_with_fixed_shape() {
        let cmd = CommandEnvelope::ping().with_request_id("001");
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            v,
            json!({"request_id": "001", "work_id": "sys", "action": "ping", "object": "None", "data": null})
        );
    }

    #[test]
    fn inference_envelopes_differ_by_stream_flag() {
        let plain = CommandEnvelope::inference("llm.1003", "hello", false);
        assert_eq!(plain.object, LLM_TEXT_OBJECT);
        assert_eq!(plain.data, json!("hello"));

        let stream = CommandEnvelope::inference("llm.1003", "hello", true);
        assert_eq!(stream.object, LLM_STREAM_OBJECT);
        assert_eq!(stream.data["delta"], "hello");
        assert_eq!(stream.data["finish"], true);
    }

    #[test]
    fn system_command_uses_timestamped_request_id() {
        let cmd = CommandEnvelope::system("reboot", Value::Null);
        assert!(cmd.request_id.starts_with("reboot_"));
        assert_eq!(cmd.object, "system");
        assert_eq!(cmd.work_id, SYS_WORK_ID);
    }

    #[test]
    fn response_success_requires_zero_code() {
        let ok: ResponseEnvelope =
            serde_json::from_str(r#"{"error":{"code":0},"data":"hi"}"#).unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.data, json!("hi"));

        let missing: ResponseEnvelope = serde_json::from_str(r#"{"data":"hi"}"#).unwrap();
        assert!(!missing.is_success());
        assert_eq!(missing.error_code(), -1);

        let failed: ResponseEnvelope =
            serde_json::from_str(r#"{"error":{"code":-4,"message":"busy"}}"#).unwrap();
        assert!(!failed.is_success());
        assert_eq!(failed.error_message(), "busy");
    }

    #[test]
    fn failure_mirrors_request_identity() {
        let cmd = CommandEnvelope::hwinfo();
        let resp = ResponseEnvelope::from_transport_error(&cmd, &TransportError::EmptyResponse);
        assert_eq!(resp.request_id, cmd.request_id);
        assert_eq!(resp.work_id, "sys");
        assert_eq!(resp.error_code(), -2);
        assert_eq!(resp.error_message(), "Empty response");
    }

    #[test]
    fn llm_setup_defaults() {
        let cmd = CommandEnvelope::llm_setup(&LlmSetup::for_model("qwen2.5-0.5B"));
        assert_eq!(cmd.object, "llm.setup");
        assert_eq!(cmd.data["model"], "qwen2.5-0.5B");
        assert_eq!(cmd.data["max_token_len"], 127);
        assert_eq!(cmd.data["enkws"], false);
    }
}
