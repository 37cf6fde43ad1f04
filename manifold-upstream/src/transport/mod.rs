//! Transport layer abstraction for upstream MCP connections
//!
//! Every transport shares the same capability set: open the connection, write
//! one framed JSON object, surface incoming framed objects on a channel, and
//! close. The connector above is transport-agnostic.

pub mod sse;
pub mod stdio;
pub mod streamable_http;
pub mod websocket;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{TransportConfig, UpstreamOptions};
use crate::error::UpstreamResult;

/// Capacity of the incoming-frame channel each transport feeds
pub(crate) const FRAME_CHANNEL_CAPACITY: usize = 256;

/// An event surfaced by a transport's reader
#[derive(Debug)]
pub enum TransportEvent {
    /// One framed JSON object received from the upstream
    Frame(Value),

    /// The connection closed; `reason` is set for abnormal closure
    Closed { reason: Option<String> },
}

/// One framed, bidirectional JSON connection to an upstream
///
/// `open` hands back the receiving half; the transport keeps whatever reader
/// task it spawned alive until `close` or the peer disconnects. Implementations
/// log and discard malformed frames rather than failing the connection.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection and start the reader
    async fn open(&mut self) -> UpstreamResult<mpsc::Receiver<TransportEvent>>;

    /// Write one framed JSON object
    async fn send(&mut self, frame: Value) -> UpstreamResult<()>;

    /// Close the connection
    async fn close(&mut self) -> UpstreamResult<()>;
}

/// Build a transport from connection parameters
pub fn create(
    upstream_id: &str,
    config: &TransportConfig,
    options: &UpstreamOptions,
) -> UpstreamResult<Box<dyn Transport>> {
    config.validate()?;
    let transport: Box<dyn Transport> = match config {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Box::new(StdioTransport::new(
            upstream_id.to_string(),
            command.clone(),
            args.clone(),
            env.clone(),
            cwd.clone(),
        )),
        TransportConfig::Websocket { url, headers } => Box::new(WebSocketTransport::new(
            url.clone(),
            merged_headers(headers, options),
        )),
        TransportConfig::Sse { url, headers } => Box::new(SseTransport::new(
            url.clone(),
            merged_headers(headers, options),
        )?),
        TransportConfig::StreamableHttp { url, headers } => Box::new(
            StreamableHttpTransport::new(url.clone(), merged_headers(headers, options))?,
        ),
    };
    Ok(transport)
}

/// Transport headers plus per-upstream option headers; options win
fn merged_headers(
    base: &std::collections::HashMap<String, String>,
    options: &UpstreamOptions,
) -> std::collections::HashMap<String, String> {
    let mut merged = base.clone();
    for (k, v) in &options.headers {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = TransportConfig::Stdio {
            command: "".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        assert!(create("u", &config, &UpstreamOptions::default()).is_err());
    }

    #[test]
    fn test_option_headers_override_transport_headers() {
        let mut base = HashMap::new();
        base.insert("x-team".to_string(), "alpha".to_string());
        base.insert("x-env".to_string(), "prod".to_string());

        let options = UpstreamOptions {
            request_timeout: None,
            headers: [("x-team".to_string(), "beta".to_string())].into(),
        };

        let merged = merged_headers(&base, &options);
        assert_eq!(merged.get("x-team").map(String::as_str), Some("beta"));
        assert_eq!(merged.get("x-env").map(String::as_str), Some("prod"));
    }
}
