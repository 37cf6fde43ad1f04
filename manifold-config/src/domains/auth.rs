//! API key authentication configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Disable API key enforcement entirely
    ///
    /// Honored only in debug builds; release builds ignore it and log a
    /// warning when set. Populated from `MCP_GATEWAY_AUTH_BYPASS=true`.
    #[serde(default)]
    pub bypass: bool,
}

impl Validatable for AuthConfig {
    fn validate(&self) -> ConfigResult<()> {
        Ok(())
    }
}
