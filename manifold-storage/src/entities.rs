//! Row types for the tables the gateway core touches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An API key row
///
/// Only the salted hash of the secret is persisted; the raw secret is shown
/// exactly once at creation and never stored.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub hashed_api_key: String,
    pub salt: String,
    /// Displayable short prefix of the secret
    pub prefix: String,
    /// JSON array of scope strings; NULL or empty grants every scope
    pub scopes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    /// Parse the scope list; `None` means unrestricted
    pub fn scope_list(&self) -> Option<Vec<String>> {
        let raw = self.scopes.as_deref()?;
        let parsed: Vec<String> = serde_json::from_str(raw).ok()?;
        if parsed.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }

    /// True when the key can still authenticate requests
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

/// A managed upstream row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManagedMcpServer {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Transport discriminant: stdio, websocket, sse, streamable_http
    pub server_type: String,
    /// JSON connection parameters, shaped per server_type
    pub connection_details: String,
    /// JSON per-upstream options (request timeout, headers, alias)
    pub mcp_options: Option<String>,
    pub status: String,
    pub is_enabled: bool,
    pub tags: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_pinged_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A traffic log row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrafficLog {
    pub id: String,
    pub server_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub mcp_method: Option<String>,
    pub mcp_request_id: Option<String>,
    pub source_ip: Option<String>,
    pub request_size_bytes: Option<i64>,
    pub response_size_bytes: Option<i64>,
    pub http_status: Option<i64>,
    pub target_server_http_status: Option<i64>,
    pub is_success: bool,
    pub duration_ms: Option<i64>,
    pub api_key_id: Option<String>,
    pub error_message: Option<String>,
    pub session_id: Option<String>,
}

/// Insert shape for a traffic row; the id and timestamp are generated
#[derive(Debug, Clone, Default)]
pub struct NewTrafficLog {
    pub server_id: Option<String>,
    pub mcp_method: Option<String>,
    pub mcp_request_id: Option<String>,
    pub source_ip: Option<String>,
    pub request_size_bytes: Option<i64>,
    pub response_size_bytes: Option<i64>,
    pub http_status: Option<i64>,
    pub target_server_http_status: Option<i64>,
    pub is_success: bool,
    pub duration_ms: Option<i64>,
    pub api_key_id: Option<String>,
    pub error_message: Option<String>,
    pub session_id: Option<String>,
}
