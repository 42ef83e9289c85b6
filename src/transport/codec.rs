//! Newline-delimited JSON framing shared by every transport.

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::{TransportError, ERR_COMMAND, ERR_EMPTY_RESPONSE};
use crate::util::abbreviate;

/// Largest frame accepted from the device.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Serialize a command to compact JSON followed by exactly one `\n`.
///
/// # Errors
///
/// Returns `TransportError::Json` if the payload cannot be serialized.
pub fn encode_frame(cmd: &CommandEnvelope) -> Result<Vec<u8>, TransportError> {
    let mut buf = serde_json::to_vec(cmd)?;
    debug!(body = %abbreviate(&String::from_utf8_lossy(&buf)), "SEND");
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one received frame. Malformed JSON becomes an error envelope
/// carrying the raw text so the caller never sees a parse panic.
#[must_use]
pub fn decode_frame(raw: &[u8], request: &CommandEnvelope) -> ResponseEnvelope {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return ResponseEnvelope::failure(request, ERR_EMPTY_RESPONSE, "Empty response");
    }
    match serde_json::from_str::<ResponseEnvelope>(text) {
        Ok(resp) => {
            debug!(body = %abbreviate(text), "RECV");
            resp
        }
        Err(e) => {
            warn!(raw = %abbreviate(text), error = %e, "Invalid JSON response");
            let mut resp = ResponseEnvelope::failure(
                request,
                ERR_COMMAND,
                format!("Invalid JSON response: {e}"),
            );
            resp.data = Value::String(text.to_string());
            resp
        }
    }
}

/// Pick a response out of a channel that also carries shell noise.
///
/// Lines not starting with `{` are noise and yield `None`. Anything else is
/// a response frame; if it does not parse it becomes an `Invalid JSON
/// response` envelope for `request`, like any other transport.
#[must_use]
pub fn parse_response_line(line: &str, request: &CommandEnvelope) -> Option<ResponseEnvelope> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    Some(decode_frame(line.as_bytes(), request))
}
