use std::time::Duration;

use crate::protocol::RemoteError;
use crate::route::RouteErrorCode;

/// Failure of a single correlated command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CorrelationError {
    #[error("command '{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        request_id: String,
        method: String,
        timeout: Duration,
    },

    #[error("device session {session_id} closed before replying")]
    SessionClosed { session_id: String },

    #[error("device reported an error: {0}")]
    Remote(RemoteError),

    #[error("failed to encode command frame: {0}")]
    Encode(String),
}

impl CorrelationError {
    /// Machine-readable code, shared by the HTTP and WebSocket surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            CorrelationError::Timeout { .. } => "TIMEOUT",
            CorrelationError::SessionClosed { .. } => "SESSION_CLOSED",
            CorrelationError::Remote(_) => "REMOTE_ERROR",
            CorrelationError::Encode(_) => "ENCODE_FAILED",
        }
    }
}

/// Failure of a dispatched command, from routing through to the device reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("{message}")]
    Route {
        code: RouteErrorCode,
        message: String,
    },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Route { code, .. } => code.as_str(),
            CommandError::UnknownMethod(_) => "UNKNOWN_METHOD",
            CommandError::InvalidParams(_) => "INVALID_PARAMS",
            CommandError::Correlation(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_method_and_duration() {
        let err = CorrelationError::Timeout {
            request_id: "r1".into(),
            method: "ping".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "command 'ping' timed out after 250ms");
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[test]
    fn command_error_codes_pass_through() {
        let err: CommandError = CorrelationError::SessionClosed {
            session_id: "d1".into(),
        }
        .into();
        assert_eq!(err.code(), "SESSION_CLOSED");

        let err = CommandError::Route {
            code: RouteErrorCode::NoDownstreamForResource,
            message: "no device".into(),
        };
        assert_eq!(err.code(), "NO_DOWNSTREAM_FOR_RESOURCE");
        assert_eq!(err.to_string(), "no device");
    }
}
