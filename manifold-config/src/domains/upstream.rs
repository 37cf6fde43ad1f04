//! Defaults applied to every upstream connector

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connector defaults
///
/// Per-upstream options stored alongside the upstream record override the
/// request timeout; the rest of these apply uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamDefaults {
    /// Handshake must complete within this window
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Default per-request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Delay before the first reconnect attempt
    #[serde(with = "humantime_serde", default = "default_backoff_initial")]
    pub backoff_initial: Duration,

    /// Exponential backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Ceiling on the reconnect delay
    #[serde(with = "humantime_serde", default = "default_backoff_max")]
    pub backoff_max: Duration,

    /// Upper bound of the random jitter added to each delay
    #[serde(with = "humantime_serde", default = "default_backoff_jitter")]
    pub backoff_jitter: Duration,

    /// Reconnect attempts before settling in the error state
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for UpstreamDefaults {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            backoff_initial: default_backoff_initial(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max: default_backoff_max(),
            backoff_jitter: default_backoff_jitter(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Validatable for UpstreamDefaults {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.connect_timeout.as_secs(), "upstream.connect_timeout")?;
        validate_positive(self.request_timeout.as_secs(), "upstream.request_timeout")?;
        validate_positive(
            self.max_reconnect_attempts as u64,
            "upstream.max_reconnect_attempts",
        )?;
        if self.backoff_multiplier < 1.0 {
            return Err(crate::error::ConfigError::ValidationError(
                "upstream.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_jitter() -> Duration {
    Duration::from_secs(1)
}

fn default_max_reconnect_attempts() -> u32 {
    5
}
