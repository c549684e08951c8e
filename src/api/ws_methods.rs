use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ApiError;
use crate::bridge::Bridge;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Incoming client request (JSON-RPC-ish).
#[derive(Debug, Deserialize)]
pub struct WsRequest {
    /// Optional request id, echoed back in the response.
    pub id: Option<Value>,
    /// Method name (e.g. "bind_resource", "ping", "create_frame").
    pub method: String,
    /// Method-specific parameters.
    pub params: Option<Value>,
    /// Per-request timeout for commands forwarded to the device.
    pub timeout_ms: Option<u64>,
}

/// Outgoing client response.
#[derive(Debug, Serialize)]
pub struct WsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl WsResponse {
    /// Build a successful response.
    pub fn success(id: Option<Value>, method: &str, result: Value) -> Self {
        Self {
            id,
            method: Some(method.to_owned()),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response tied to a particular request.
    pub fn error(id: Option<Value>, method: &str, code: &str, message: &str) -> Self {
        Self {
            id,
            method: Some(method.to_owned()),
            result: None,
            error: Some(WsError {
                code: code.to_owned(),
                message: message.to_owned(),
            }),
        }
    }

    fn from_api_error(id: Option<Value>, method: &str, err: ApiError) -> Self {
        Self::error(id, method, err.code(), &err.message())
    }

    /// Build a protocol-level error (no method or id available).
    pub fn protocol_error(code: &str, message: &str) -> Self {
        Self {
            id: None,
            method: None,
            result: None,
            error: Some(WsError {
                code: code.to_owned(),
                message: message.to_owned(),
            }),
        }
    }
}

/// Error payload inside a [`WsResponse`].
#[derive(Debug, Serialize, Deserialize)]
pub struct WsError {
    pub code: String,
    pub message: String,
}

/// Server-initiated message with no request id.
#[derive(Debug, Serialize)]
pub struct WsNotification {
    pub method: &'static str,
    pub params: Value,
}

// ---------------------------------------------------------------------------
// Method-specific param types
// ---------------------------------------------------------------------------

/// Parameters for the `bind_resource` method.
#[derive(Debug, Deserialize)]
pub struct BindResourceParams {
    #[serde(alias = "fileKey", alias = "resource_id")]
    pub resource: String,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Parse params from a WsRequest, returning a WsResponse error on failure.
fn parse_params<T: serde::de::DeserializeOwned>(req: &WsRequest) -> Result<T, WsResponse> {
    let params = req
        .params
        .clone()
        .unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| {
        WsResponse::error(
            req.id.clone(),
            &req.method,
            "invalid_request",
            &format!("Invalid params: {}.", e),
        )
    })
}

fn serialize_result<T: Serialize>(id: Option<Value>, method: &str, value: &T) -> WsResponse {
    match serde_json::to_value(value) {
        Ok(v) => WsResponse::success(id, method, v),
        Err(e) => WsResponse::error(id, method, "internal_error", &e.to_string()),
    }
}

/// Handle one request from the client session `session_id`.
///
/// `bind_resource`, `route` and `diagnostics` are answered by the bridge
/// itself; every other method is dispatched to the device serving the
/// session's resource.
pub async fn dispatch(req: &WsRequest, bridge: &Bridge, session_id: &str) -> WsResponse {
    let id = req.id.clone();
    let method = req.method.as_str();

    match method {
        "bind_resource" => {
            let params: BindResourceParams = match parse_params(req) {
                Ok(p) => p,
                Err(e) => return e,
            };
            if let Err(e) = bridge.bind_resource(session_id, &params.resource) {
                return WsResponse::from_api_error(id, method, e.into());
            }
            let route = bridge.resolve_route(session_id);
            WsResponse::success(
                id,
                method,
                serde_json::json!({ "resource": params.resource, "route": route }),
            )
        }
        "route" => serialize_result(id, method, &bridge.resolve_route(session_id)),
        "diagnostics" => serialize_result(id, method, &bridge.diagnostics()),
        _ => {
            let params = req.params.clone().unwrap_or(Value::Object(Default::default()));
            let timeout = req.timeout_ms.map(Duration::from_millis);
            match bridge.execute(session_id, method, params, timeout).await {
                Ok(result) => WsResponse::success(id, method, result),
                Err(e) => {
                    tracing::debug!(session_id, method, code = e.code(), "client command failed");
                    WsResponse::from_api_error(id, method, e.into())
                }
            }
        }
    }
}
