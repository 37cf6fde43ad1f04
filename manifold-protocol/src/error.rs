//! The gateway error contract: numeric codes and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::jsonrpc::JsonRpcError;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Stable numeric error codes carried in JSON-RPC error objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    ServerUnavailable = -32000,
    ServerError = -32001,
    ServerTimeout = -32002,
    ServerConnection = -32003,
    ServerSend = -32004,
    RequestTimeout = -32005,
    ResourceNotFound = -32006,
    Unauthenticated = -32009,
    AuthenticationFailed = -32010,
    SessionNotFound = -32011,
    InvalidSessionId = -32012,
    StreamError = -32013,
    MaxSessions = -32014,
}

/// Errors surfaced by the gateway on its own behalf
///
/// Upstream JSON-RPC error objects are passed through verbatim and never
/// re-wrapped in one of these variants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Invalid JSON in a request body
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Structurally invalid JSON-RPC message
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Unknown method or unknown gateway tool
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    /// Invalid method parameters
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// Internal gateway error
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// The upstream connector exists but is not in the running state
    #[error("Upstream '{upstream_id}' is not ready")]
    ConnectionNotReady { upstream_id: String },

    /// The upstream transport failed while the request was in flight
    #[error("Upstream connection error: {message}")]
    ServerConnection { message: String },

    /// The frame could not be handed to the upstream transport
    #[error("Upstream send failed: {message}")]
    ServerSend { message: String },

    /// The upstream did not answer within the configured request timeout
    #[error("Upstream request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    /// Referenced entity (upstream, resource) does not exist
    #[error("Resource not found: {resource}")]
    ResourceNotFound { resource: String },

    /// No credentials were presented
    #[error("Authentication required")]
    Unauthenticated,

    /// Credentials were presented but rejected, or the key lacks a scope
    #[error("Authentication failed")]
    AuthenticationFailed {
        /// True when a valid key was rejected for a missing scope
        insufficient_scope: bool,
    },

    /// The session id is unknown, expired, or bound to another upstream
    #[error("Session not found")]
    SessionNotFound,

    /// The session id is syntactically unacceptable
    #[error("Invalid session id")]
    InvalidSessionId,

    /// A response stream failed mid-write
    #[error("Stream error: {message}")]
    StreamError { message: String },

    /// The session store refused to allocate another session
    #[error("Maximum session count reached")]
    MaxSessions,
}

impl GatewayError {
    /// Shorthand for internal errors
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Numeric code carried in the JSON-RPC error object
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Parse { .. } => ErrorCode::ParseError,
            GatewayError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            GatewayError::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            GatewayError::InvalidParams { .. } => ErrorCode::InvalidParams,
            GatewayError::Internal { .. } => ErrorCode::InternalError,
            GatewayError::ConnectionNotReady { .. } => ErrorCode::ServerUnavailable,
            GatewayError::ServerConnection { .. } => ErrorCode::ServerConnection,
            GatewayError::ServerSend { .. } => ErrorCode::ServerSend,
            GatewayError::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            GatewayError::ResourceNotFound { .. } => ErrorCode::ResourceNotFound,
            GatewayError::Unauthenticated => ErrorCode::Unauthenticated,
            GatewayError::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailed,
            GatewayError::SessionNotFound => ErrorCode::SessionNotFound,
            GatewayError::InvalidSessionId => ErrorCode::InvalidSessionId,
            GatewayError::StreamError { .. } => ErrorCode::StreamError,
            GatewayError::MaxSessions => ErrorCode::MaxSessions,
        }
    }

    /// HTTP status used when this error is reported outside a stream
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Parse { .. }
            | GatewayError::InvalidRequest { .. }
            | GatewayError::InvalidParams { .. }
            | GatewayError::InvalidSessionId => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::AuthenticationFailed { insufficient_scope } => {
                if *insufficient_scope {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::UNAUTHORIZED
                }
            }
            GatewayError::MethodNotFound { .. }
            | GatewayError::ResourceNotFound { .. }
            | GatewayError::SessionNotFound => StatusCode::NOT_FOUND,
            GatewayError::ConnectionNotReady { .. } | GatewayError::ServerConnection { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ServerSend { .. }
            | GatewayError::StreamError { .. }
            | GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::MaxSessions => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Build the JSON-RPC error object for this error
    ///
    /// The message never names a specific credential; auth failures read the
    /// same whichever key was wrong.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let message = match self {
            GatewayError::Unauthenticated => "Authentication required".to_string(),
            GatewayError::AuthenticationFailed { .. } => "Authentication failed".to_string(),
            other => other.to_string(),
        };
        JsonRpcError::new(self.code() as i32, message)
    }
}

/// Error body for HTTP-level (non-stream) reporting
#[derive(Debug, Serialize)]
struct ErrorBody {
    jsonrpc: &'static str,
    error: JsonRpcError,
    id: Option<serde_json::Value>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            jsonrpc: crate::jsonrpc::JSONRPC_VERSION,
            error: self.to_rpc_error(),
            id: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_code_contract() {
        assert_eq!(ErrorCode::ParseError as i32, -32700);
        assert_eq!(ErrorCode::InvalidRequest as i32, -32600);
        assert_eq!(ErrorCode::MethodNotFound as i32, -32601);
        assert_eq!(ErrorCode::InvalidParams as i32, -32602);
        assert_eq!(ErrorCode::InternalError as i32, -32603);
        assert_eq!(ErrorCode::ServerUnavailable as i32, -32000);
        assert_eq!(ErrorCode::ServerError as i32, -32001);
        assert_eq!(ErrorCode::ServerTimeout as i32, -32002);
        assert_eq!(ErrorCode::ServerConnection as i32, -32003);
        assert_eq!(ErrorCode::ServerSend as i32, -32004);
        assert_eq!(ErrorCode::RequestTimeout as i32, -32005);
        assert_eq!(ErrorCode::ResourceNotFound as i32, -32006);
        assert_eq!(ErrorCode::Unauthenticated as i32, -32009);
        assert_eq!(ErrorCode::AuthenticationFailed as i32, -32010);
        assert_eq!(ErrorCode::SessionNotFound as i32, -32011);
        assert_eq!(ErrorCode::InvalidSessionId as i32, -32012);
        assert_eq!(ErrorCode::StreamError as i32, -32013);
        assert_eq!(ErrorCode::MaxSessions as i32, -32014);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(GatewayError::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::AuthenticationFailed {
                insufficient_scope: false
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::AuthenticationFailed {
                insufficient_scope: true
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(GatewayError::SessionNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::ServerConnection {
                message: "refused".to_string()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::RequestTimeout {
                timeout: Duration::from_secs(30)
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_auth_errors_do_not_leak_detail() {
        let err = GatewayError::AuthenticationFailed {
            insufficient_scope: false,
        };
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32010);
        assert_eq!(rpc.message, "Authentication failed");
        assert!(rpc.data.is_none());
    }

    #[test]
    fn test_unknown_tool_is_method_not_found() {
        let err = GatewayError::MethodNotFound {
            method: "echo__missing".to_string(),
        };
        assert_eq!(err.to_rpc_error().code, -32601);
    }
}
