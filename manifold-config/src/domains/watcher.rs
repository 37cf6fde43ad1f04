//! Dev-watcher configuration

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Dev-watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Whether the watcher runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Coalescing window for bursts of filesystem events
    #[serde(with = "humantime_serde", default = "default_debounce")]
    pub debounce: Duration,

    /// Watched paths and the upstreams they restart
    #[serde(default)]
    pub targets: Vec<WatchTarget>,
}

/// One watched path bound to one stdio upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchTarget {
    /// Upstream restarted when the path changes
    pub upstream_id: String,

    /// Filesystem path to watch
    pub path: PathBuf,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debounce: default_debounce(),
            targets: Vec::new(),
        }
    }
}

impl Validatable for WatcherConfig {
    fn validate(&self) -> ConfigResult<()> {
        for target in &self.targets {
            validate_required_string(&target.upstream_id, "watcher.targets.upstream_id")?;
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_debounce() -> Duration {
    Duration::from_millis(100)
}
