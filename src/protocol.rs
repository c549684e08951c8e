//! Wire envelopes exchanged with device connections.
//!
//! The bridge only understands enough of a device frame to correlate replies:
//! a `requestId` plus either `result` or `error`. Everything else is passed
//! through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command frame written to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub request_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Error payload reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(ref code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl RemoteError {
    /// Devices report errors either as a bare string or as an object with a
    /// `message` (and optionally `code`) field.
    fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self { code: None, message },
            Value::Object(ref map) => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                let code = map.get("code").and_then(|c| match c {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                Self { code, message }
            }
            other => Self {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

/// A parsed device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFrame {
    /// Reply to a command the bridge sent.
    Response {
        request_id: String,
        outcome: Result<Value, RemoteError>,
    },
    /// Anything else: unsolicited events, handshakes, logs.
    Other(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Parse a raw text frame received from a device.
///
/// A frame is a response when it is an object carrying a string `requestId`
/// and at least one of `result` / `error`. A present, non-null `error` wins
/// over `result`.
pub fn parse_device_frame(raw: &str) -> Result<DeviceFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(mut map) = value else {
        return Ok(DeviceFrame::Other(value));
    };

    let request_id = match map.get("requestId") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => return Ok(DeviceFrame::Other(Value::Object(map))),
    };
    if !map.contains_key("result") && !map.contains_key("error") {
        return Ok(DeviceFrame::Other(Value::Object(map)));
    }

    let outcome = match map.remove("error") {
        Some(err) if !err.is_null() => Err(RemoteError::from_value(err)),
        _ => Ok(map.remove("result").unwrap_or(Value::Null)),
    };
    Ok(DeviceFrame::Response {
        request_id,
        outcome,
    })
}
