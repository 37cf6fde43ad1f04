//! Registry event bus types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use manifold_protocol::Tool;

/// Connector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Stopped,
    Starting,
    Running,
    Reconnecting,
    Error,
    Stopping,
}

impl UpstreamStatus {
    /// Stable string form, matching the persisted `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Stopped => "stopped",
            UpstreamStatus::Starting => "starting",
            UpstreamStatus::Running => "running",
            UpstreamStatus::Reconnecting => "reconnecting",
            UpstreamStatus::Error => "error",
            UpstreamStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published on the registry bus
///
/// This bus is the only channel through which the aggregator, gateway and
/// audit sink observe upstream state.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// A connector changed state
    StatusChanged {
        upstream_id: String,
        old: UpstreamStatus,
        new: UpstreamStatus,
        detail: Option<String>,
    },

    /// An upstream's advertised tool set changed
    ToolsChanged {
        upstream_id: String,
        tools: Vec<Tool>,
    },

    /// An upstream-initiated frame not correlated to any pending request
    PushMessage {
        upstream_id: String,
        message: Value,
    },
}

impl UpstreamEvent {
    /// The upstream this event concerns
    pub fn upstream_id(&self) -> &str {
        match self {
            UpstreamEvent::StatusChanged { upstream_id, .. }
            | UpstreamEvent::ToolsChanged { upstream_id, .. }
            | UpstreamEvent::PushMessage { upstream_id, .. } => upstream_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_form() {
        assert_eq!(UpstreamStatus::Running.as_str(), "running");
        assert_eq!(UpstreamStatus::Reconnecting.to_string(), "reconnecting");

        let json = serde_json::to_string(&UpstreamStatus::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }
}
