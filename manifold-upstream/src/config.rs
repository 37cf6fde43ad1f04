//! Upstream configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{UpstreamError, UpstreamResult};

/// Connection parameters, shaped per transport kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking newline-delimited JSON on its standard streams
    Stdio {
        /// Command to execute
        command: String,

        /// Command arguments
        #[serde(default)]
        args: Vec<String>,

        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,

        /// Working directory
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// WebSocket endpoint carrying one JSON message per text frame
    Websocket {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Server-Sent-Events endpoint with a POST side-channel
    Sse {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Bidirectional chunked-HTTP endpoint
    StreamableHttp {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Validate the connection parameters
    pub fn validate(&self) -> UpstreamResult<()> {
        match self {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(UpstreamError::Configuration {
                        message: "stdio transport command cannot be empty".to_string(),
                    });
                }
            }
            TransportConfig::Websocket { url, .. } => {
                let parsed = url::Url::parse(url).map_err(|e| UpstreamError::Configuration {
                    message: format!("invalid websocket URL: {}", e),
                })?;
                match parsed.scheme() {
                    "ws" | "wss" => {}
                    scheme => {
                        return Err(UpstreamError::Configuration {
                            message: format!("unsupported websocket scheme: {}", scheme),
                        });
                    }
                }
            }
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                let parsed = url::Url::parse(url).map_err(|e| UpstreamError::Configuration {
                    message: format!("invalid URL: {}", e),
                })?;
                match parsed.scheme() {
                    "http" | "https" => {}
                    scheme => {
                        return Err(UpstreamError::Configuration {
                            message: format!("unsupported URL scheme: {}", scheme),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Transport kind name, matching the persisted `server_type` column
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Websocket { .. } => "websocket",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// Per-upstream knobs layered over the connector defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamOptions {
    /// Override for the per-request timeout
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,

    /// Extra headers sent on network transports
    pub headers: HashMap<String, String>,
}

/// Configuration and identity of one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Stable identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Namespacing prefix; falls back to the name when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Connection parameters
    pub transport: TransportConfig,

    /// Per-upstream options
    #[serde(default)]
    pub options: UpstreamOptions,

    /// Whether the registry keeps a connector alive for this upstream
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl UpstreamConfig {
    /// Whether switching to `other` requires tearing the connection down
    ///
    /// Connection parameters are material; name, alias and options are not.
    pub fn materially_differs(&self, other: &UpstreamConfig) -> bool {
        self.transport != other.transport
    }

    /// The prefix used for namespacing this upstream's tools
    pub fn namespace(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(command: &str) -> UpstreamConfig {
        UpstreamConfig {
            id: "u1".to_string(),
            name: "echo".to_string(),
            alias: None,
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            options: UpstreamOptions::default(),
            enabled: true,
        }
    }

    #[test]
    fn test_transport_validation() {
        assert!(stdio_config("echo-server").transport.validate().is_ok());
        assert!(stdio_config("  ").transport.validate().is_err());

        let ws = TransportConfig::Websocket {
            url: "wss://example.com/mcp".to_string(),
            headers: HashMap::new(),
        };
        assert!(ws.validate().is_ok());

        let bad_ws = TransportConfig::Websocket {
            url: "https://example.com/mcp".to_string(),
            headers: HashMap::new(),
        };
        assert!(bad_ws.validate().is_err());

        let sse = TransportConfig::Sse {
            url: "not a url".to_string(),
            headers: HashMap::new(),
        };
        assert!(sse.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = stdio_config("echo-server");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["transport"]["type"], "stdio");

        let back: UpstreamConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_material_difference() {
        let a = stdio_config("echo-server");

        let mut renamed = a.clone();
        renamed.name = "other".to_string();
        renamed.options.request_timeout = Some(Duration::from_secs(5));
        assert!(!a.materially_differs(&renamed));

        let mut moved = a.clone();
        moved.transport = TransportConfig::Stdio {
            command: "other-server".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        assert!(a.materially_differs(&moved));
    }

    #[test]
    fn test_namespace_prefers_alias() {
        let mut config = stdio_config("echo-server");
        assert_eq!(config.namespace(), "echo");
        config.alias = Some("e2".to_string());
        assert_eq!(config.namespace(), "e2");
    }
}
