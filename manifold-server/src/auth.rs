//! API key authentication

use axum::http::HeaderMap;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use manifold_protocol::{GatewayError, GatewayResult};
use manifold_storage::{ApiKey, ApiKeyRepository};

/// Scope required to initialize a session
pub const SCOPE_CONNECT: &str = "mcp:connect";
/// Scope required to list tools
pub const SCOPE_TOOLS_LIST: &str = "tools:list";
/// Scope required to invoke tools
pub const SCOPE_TOOLS_CALL: &str = "tools:call";

/// Displayable prefix length taken from the raw secret
const PREFIX_LEN: usize = 8;

/// The authenticated caller of one request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Matched key id; absent under the development bypass
    pub api_key_id: Option<String>,
    /// Granted scopes; `None` grants everything
    scopes: Option<Vec<String>>,
}

impl AuthContext {
    /// Context carrying every scope, used by the development bypass
    pub fn unrestricted() -> Self {
        Self {
            api_key_id: None,
            scopes: None,
        }
    }

    pub fn allows(&self, scope: &str) -> bool {
        match &self.scopes {
            None => true,
            Some(scopes) => scopes.iter().any(|s| s == scope),
        }
    }
}

/// Validates API keys against the persisted hashes
pub struct AuthService {
    keys: Arc<dyn ApiKeyRepository>,
    bypass: bool,
}

impl AuthService {
    /// `bypass_requested` is only honored in debug builds
    pub fn new(keys: Arc<dyn ApiKeyRepository>, bypass_requested: bool) -> Arc<Self> {
        let bypass = if bypass_requested {
            if cfg!(debug_assertions) {
                warn!("API key enforcement is DISABLED (MCP_GATEWAY_AUTH_BYPASS)");
                true
            } else {
                warn!("ignoring MCP_GATEWAY_AUTH_BYPASS in a release build");
                false
            }
        } else {
            false
        };
        Arc::new(Self { keys, bypass })
    }

    /// Resolve the caller from request headers
    pub async fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<AuthContext> {
        if self.bypass {
            return Ok(AuthContext::unrestricted());
        }

        let token = extract_token(headers).ok_or(GatewayError::Unauthenticated)?;

        let keys = self
            .keys
            .list_active()
            .await
            .map_err(|e| GatewayError::internal(format!("key lookup failed: {}", e)))?;

        let now = Utc::now();
        for key in keys {
            if !key.is_usable(now) {
                continue;
            }
            if verify_secret(&key, &token) {
                debug!(api_key_id = %key.id, "authenticated");
                self.touch(key.id.clone());
                let scopes = key.scope_list();
                return Ok(AuthContext {
                    api_key_id: Some(key.id),
                    scopes,
                });
            }
        }

        Err(GatewayError::AuthenticationFailed {
            insufficient_scope: false,
        })
    }

    /// Check one scope against the context
    pub fn require_scope(&self, context: &AuthContext, scope: &str) -> GatewayResult<()> {
        if context.allows(scope) {
            Ok(())
        } else {
            Err(GatewayError::AuthenticationFailed {
                insufficient_scope: true,
            })
        }
    }

    /// Record key usage without blocking the request
    fn touch(&self, key_id: String) {
        let keys = Arc::clone(&self.keys);
        tokio::spawn(async move {
            if let Err(e) = keys.touch_last_used(&key_id, Utc::now()).await {
                warn!(error = %e, "failed to update key last_used_at");
            }
        });
    }
}

/// Pull the raw token from `Authorization: Bearer` or `X-Api-Key`
fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Salted hash of a raw secret, hex encoded
pub fn hash_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time verification of a presented secret against a key row
fn verify_secret(key: &ApiKey, secret: &str) -> bool {
    let computed = hash_secret(&key.salt, secret);
    computed.as_bytes().ct_eq(key.hashed_api_key.as_bytes()).into()
}

/// Issue a new key
///
/// Returns the row to persist together with the raw secret; the secret is
/// never recoverable afterwards.
pub fn generate_key(name: &str, scopes: Option<Vec<String>>) -> (ApiKey, String) {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();

    let secret: String = (0..40)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    let secret = format!("mfk_{}", secret);

    let salt: String = hex::encode(rng.random::<[u8; 16]>());
    let now = Utc::now();

    let key = ApiKey {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        hashed_api_key: hash_secret(&salt, &secret),
        salt,
        prefix: secret[..PREFIX_LEN].to_string(),
        scopes: scopes.map(|s| serde_json::to_string(&s).unwrap_or_default()),
        expires_at: None,
        last_used_at: None,
        revoked_at: None,
        created_at: now,
        updated_at: now,
    };
    (key, secret)
}
