//! Configuration loading and environment variable handling

use crate::domains::ManifoldConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;

/// Configuration loader with environment variable support
///
/// Prefixed variables (`MANIFOLD_PORT`, `MANIFOLD_BIND_ADDRESS`, ...) override
/// file values. `DATABASE_URL`, `PORT` and `MCP_GATEWAY_AUTH_BYPASS` are also
/// honored unprefixed, matching the deployment contract.
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with the default prefix
    pub fn new() -> Self {
        Self {
            prefix: "MANIFOLD".to_string(),
        }
    }

    /// Create a new config loader with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ManifoldConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ManifoldConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ManifoldConfig> {
        let mut config = ManifoldConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ManifoldConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ManifoldConfig) -> ConfigResult<()> {
        if let Ok(bind) = self.get_env_var("BIND_ADDRESS") {
            config.server.bind_address = bind;
        }

        // PORT wins unprefixed per the deployment contract
        let port_value = std::env::var("PORT")
            .or_else(|_| self.get_env_var("PORT"))
            .ok();
        if let Some(port) = port_value {
            config.server.port = port
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid PORT: {}", e)))?;
        }

        if let Ok(url) = std::env::var("DATABASE_URL").or_else(|_| self.get_env_var("DATABASE_URL")) {
            config.database.url = url;
        }

        if let Ok(bypass) = std::env::var("MCP_GATEWAY_AUTH_BYPASS") {
            config.auth.bypass = bypass.eq_ignore_ascii_case("true");
        }

        if let Ok(filter) = self.get_env_var("LOG_FILTER") {
            config.logging.filter = filter;
        }

        Ok(())
    }

    /// Read a prefixed environment variable
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
