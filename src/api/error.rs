use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{CommandError, CorrelationError};
use crate::protocol::RemoteError;
use crate::registry::RegistryError;
use crate::route::RouteErrorCode;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. The WebSocket surface reuses the same code
/// and message so clients see one vocabulary.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Command params failed validation.
    InvalidParams(String),
    /// 400 - No handler for the method and passthrough is off.
    UnknownMethod(String),
    /// 400/404/409/503 - The command could not be routed to a device.
    Route {
        code: RouteErrorCode,
        message: String,
    },
    /// 404 - Unknown client session.
    SessionNotFound(String),
    /// 502 - The device session closed before replying.
    SessionClosed(String),
    /// 502 - The device answered with an error.
    Remote(RemoteError),
    /// 504 - The device did not answer in time.
    Timeout(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidParams(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownMethod(_) => StatusCode::BAD_REQUEST,
            ApiError::Route { code, .. } => match code {
                RouteErrorCode::InvalidResourceId => StatusCode::BAD_REQUEST,
                RouteErrorCode::NoResourceForSession => StatusCode::CONFLICT,
                RouteErrorCode::NoDownstreamForResource => StatusCode::NOT_FOUND,
                RouteErrorCode::DownstreamSessionGone => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionClosed(_) => StatusCode::BAD_GATEWAY,
            ApiError::Remote(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidParams(_) => "invalid_params",
            ApiError::UnknownMethod(_) => "unknown_method",
            ApiError::Route { code, .. } => match code {
                RouteErrorCode::NoResourceForSession => "no_resource_for_session",
                RouteErrorCode::InvalidResourceId => "invalid_resource_id",
                RouteErrorCode::NoDownstreamForResource => "no_downstream_for_resource",
                RouteErrorCode::DownstreamSessionGone => "downstream_session_gone",
            },
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::SessionClosed(_) => "session_closed",
            ApiError::Remote(_) => "remote_error",
            ApiError::Timeout(_) => "timeout",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidParams(detail) => format!("Invalid params: {}.", detail),
            ApiError::UnknownMethod(method) => format!("Unknown method: {}.", method),
            ApiError::Route { message, .. } => message.clone(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::SessionClosed(id) => {
                format!("Device session {} closed before replying.", id)
            }
            ApiError::Remote(err) => format!("Device reported an error: {}.", err),
            ApiError::Timeout(detail) => format!("Timed out: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Route { code, message } => ApiError::Route { code, message },
            CommandError::UnknownMethod(method) => ApiError::UnknownMethod(method),
            CommandError::InvalidParams(detail) => ApiError::InvalidParams(detail),
            CommandError::Correlation(e) => e.into(),
        }
    }
}

impl From<CorrelationError> for ApiError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Timeout { .. } => ApiError::Timeout(err.to_string()),
            CorrelationError::SessionClosed { session_id } => ApiError::SessionClosed(session_id),
            CorrelationError::Remote(remote) => ApiError::Remote(remote),
            CorrelationError::Encode(detail) => ApiError::InternalError(detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id),
            other => ApiError::InvalidRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;

    /// Helper: convert an ApiError into a response and extract the status and
    /// parsed JSON body.
    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    fn route(code: RouteErrorCode) -> ApiError {
        ApiError::Route {
            code,
            message: "No device plugin is connected for resource doc-42.".into(),
        }
    }

    // ── Route failures ─────────────────────────────────────────────

    #[tokio::test]
    async fn route_failures_map_to_distinct_statuses() {
        let cases = [
            (RouteErrorCode::InvalidResourceId, StatusCode::BAD_REQUEST, "invalid_resource_id"),
            (RouteErrorCode::NoResourceForSession, StatusCode::CONFLICT, "no_resource_for_session"),
            (RouteErrorCode::NoDownstreamForResource, StatusCode::NOT_FOUND, "no_downstream_for_resource"),
            (RouteErrorCode::DownstreamSessionGone, StatusCode::SERVICE_UNAVAILABLE, "downstream_session_gone"),
        ];
        for (code, status, code_str) in cases {
            let (got_status, json) = response_parts(route(code)).await;
            assert_eq!(got_status, status, "{code_str}");
            assert_eq!(json["error"]["code"], code_str);
        }
    }

    #[tokio::test]
    async fn route_message_is_passed_through() {
        let (_, json) = response_parts(route(RouteErrorCode::NoDownstreamForResource)).await;
        assert_eq!(
            json["error"]["message"],
            "No device plugin is connected for resource doc-42."
        );
    }

    // ── Correlation failures ───────────────────────────────────────

    #[tokio::test]
    async fn timeout_is_gateway_timeout() {
        let err: ApiError = CorrelationError::Timeout {
            request_id: "r1".into(),
            method: "ping".into(),
            timeout: Duration::from_millis(100),
        }
        .into();
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json["error"]["code"], "timeout");
        assert_eq!(
            json["error"]["message"],
            "Timed out: command 'ping' timed out after 100ms."
        );
    }

    #[tokio::test]
    async fn session_closed_is_bad_gateway() {
        let err: ApiError = CommandError::from(CorrelationError::SessionClosed {
            session_id: "d1".into(),
        })
        .into();
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["code"], "session_closed");
    }

    #[tokio::test]
    async fn remote_error_includes_device_message() {
        let err = ApiError::Remote(RemoteError {
            code: None,
            message: "node not found".into(),
        });
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["message"], "Device reported an error: node not found.");
    }

    // ── Validation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_request_includes_detail() {
        let (status, json) =
            response_parts(ApiError::InvalidRequest("missing resource".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "Invalid request: missing resource.");
    }

    #[tokio::test]
    async fn unknown_method_code() {
        let err: ApiError = CommandError::UnknownMethod("explode".into()).into();
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "unknown_method");
    }

    #[tokio::test]
    async fn registry_not_found_is_session_not_found() {
        let err: ApiError = RegistryError::NotFound("u9".into()).into();
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "session_not_found");
    }

    // ── JSON structure tests ───────────────────────────────────────

    #[tokio::test]
    async fn response_has_error_wrapper() {
        let (_, json) = response_parts(ApiError::InternalError("x".into())).await;
        assert!(json["error"].get("code").is_some());
        assert!(json["error"].get("message").is_some());
    }

    #[tokio::test]
    async fn response_content_type_is_json() {
        let response = ApiError::InvalidParams("x".into()).into_response();
        let ct = response
            .headers()
            .get("content-type")
            .expect("response must have content-type header");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
