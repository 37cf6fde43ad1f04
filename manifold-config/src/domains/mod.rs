//! Domain-specific configuration modules

pub mod auth;
pub mod database;
pub mod gateway;
pub mod logging;
pub mod server;
pub mod upstream;
pub mod watcher;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Manifold configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ManifoldConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: server::ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: database::DatabaseConfig,

    /// API key authentication configuration
    #[serde(default)]
    pub auth: auth::AuthConfig,

    /// Gateway session and streaming configuration
    #[serde(default)]
    pub gateway: gateway::GatewayConfig,

    /// Defaults applied to upstream connectors
    #[serde(default)]
    pub upstream: upstream::UpstreamDefaults,

    /// Dev-watcher configuration (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher: Option<watcher::WatcherConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl ManifoldConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.server.validate()?;
        self.database.validate()?;
        self.auth.validate()?;
        self.gateway.validate()?;
        self.upstream.validate()?;
        self.logging.validate()?;

        if let Some(ref watcher) = self.watcher {
            watcher.validate()?;
        }

        Ok(())
    }
}
