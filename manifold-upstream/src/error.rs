//! Error types for upstream connections

use std::time::Duration;
use thiserror::Error;

use manifold_protocol::GatewayError;

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Errors raised by transports and connectors
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// Invalid connection parameters
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The transport could not be established
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Handshake or connect did not finish in time
    #[error("Connection timeout after {timeout:?}")]
    ConnectionTimeout { timeout: Duration },

    /// The connector is not in the running state
    #[error("Upstream '{upstream_id}' is not ready")]
    NotReady { upstream_id: String },

    /// The transport failed mid-operation
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A frame could not be serialized or parsed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// A frame could not be written to the transport
    #[error("Send failed: {message}")]
    SendFailed { message: String },

    /// The upstream did not answer within the request timeout
    #[error("Request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    /// The MCP handshake was rejected
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    /// The connection closed while a request was pending
    #[error("Connection closed")]
    Closed,
}

impl UpstreamError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => UpstreamError::ConnectionFailed {
                message: err.to_string(),
            },
            _ => UpstreamError::Transport {
                message: err.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::RequestTimeout {
                timeout: Duration::from_secs(30),
            }
        } else if err.is_connect() {
            UpstreamError::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            UpstreamError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotReady { upstream_id } => GatewayError::ConnectionNotReady { upstream_id },
            UpstreamError::RequestTimeout { timeout } => GatewayError::RequestTimeout { timeout },
            UpstreamError::SendFailed { message } => GatewayError::ServerSend { message },
            UpstreamError::Configuration { message } => GatewayError::InvalidParams { message },
            UpstreamError::ConnectionFailed { message }
            | UpstreamError::Transport { message }
            | UpstreamError::Handshake { message } => GatewayError::ServerConnection { message },
            UpstreamError::ConnectionTimeout { timeout } => GatewayError::RequestTimeout { timeout },
            UpstreamError::Closed => GatewayError::ServerConnection {
                message: "connection closed".to_string(),
            },
            UpstreamError::Serialization { message } => GatewayError::internal(message),
        }
    }
}
