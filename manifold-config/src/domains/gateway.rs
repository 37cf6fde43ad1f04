//! Gateway session and streaming configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Sessions idle longer than this are expired
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub session_idle_timeout: Duration,

    /// Interval of the session cleanup scan
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub session_cleanup_interval: Duration,

    /// Upper bound on concurrently live sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Keep-alive comment interval on background push streams
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub keepalive_interval: Duration,

    /// Frames buffered per background stream before the oldest is dropped
    #[serde(default = "default_push_queue_depth")]
    pub push_queue_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: default_idle_timeout(),
            session_cleanup_interval: default_cleanup_interval(),
            max_sessions: default_max_sessions(),
            keepalive_interval: default_keepalive_interval(),
            push_queue_depth: default_push_queue_depth(),
        }
    }
}

impl Validatable for GatewayConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_sessions as u64, "gateway.max_sessions")?;
        validate_positive(self.push_queue_depth as u64, "gateway.push_queue_depth")?;
        validate_positive(
            self.session_idle_timeout.as_secs(),
            "gateway.session_idle_timeout",
        )
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(25)
}

fn default_push_queue_depth() -> usize {
    256
}
