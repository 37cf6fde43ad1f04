//! Server-Sent-Events transport: an event stream down, HTTP POST up
//!
//! The server announces its message endpoint in the first `endpoint` event;
//! every outgoing frame is POSTed there. Incoming `message` events carry one
//! JSON object each.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::{Transport, TransportEvent, FRAME_CHANNEL_CAPACITY};
use crate::error::{UpstreamError, UpstreamResult};

/// SSE client transport
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    client: Client,

    /// POST target announced by the server
    endpoint: Arc<RwLock<Option<String>>>,
}

impl SseTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> UpstreamResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| UpstreamError::Configuration {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            url,
            headers,
            client,
            endpoint: Arc::new(RwLock::new(None)),
        })
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        builder
    }

    /// Resolve a possibly-relative endpoint against the stream URL
    fn resolve_endpoint(base: &str, endpoint: &str) -> Option<String> {
        let base = url::Url::parse(base).ok()?;
        base.join(endpoint).ok().map(|u| u.to_string())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(&mut self) -> UpstreamResult<mpsc::Receiver<TransportEvent>> {
        let builder = self
            .apply_headers(self.client.get(&self.url))
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");

        let response = builder.send().await.map_err(|e| UpstreamError::ConnectionFailed {
            message: format!("failed to connect to SSE endpoint: {}", e),
        })?;

        if !response.status().is_success() {
            return Err(UpstreamError::ConnectionFailed {
                message: format!("SSE connection failed with status: {}", response.status()),
            });
        }

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let endpoint = Arc::clone(&self.endpoint);
        let base_url = self.url.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Closed {
                                reason: Some(format!("SSE stream error: {}", e)),
                            })
                            .await;
                        return;
                    }
                };

                let Ok(text) = std::str::from_utf8(&chunk) else {
                    warn!("discarding non-UTF-8 SSE chunk");
                    continue;
                };
                buffer.push_str(text);

                // Events are separated by a blank line
                while let Some(boundary) = buffer.find("\n\n") {
                    let raw_event = buffer[..boundary].to_string();
                    buffer.drain(..boundary + 2);

                    let mut event_name = String::from("message");
                    let mut data_lines = Vec::new();
                    for line in raw_event.lines() {
                        if let Some(name) = line.strip_prefix("event:") {
                            event_name = name.trim().to_string();
                        } else if let Some(data) = line.strip_prefix("data:") {
                            data_lines.push(data.trim_start().to_string());
                        }
                        // Comment lines (":") and ids are ignored
                    }
                    if data_lines.is_empty() {
                        continue;
                    }
                    let data = data_lines.join("\n");

                    match event_name.as_str() {
                        "endpoint" => {
                            if let Some(resolved) = Self::resolve_endpoint(&base_url, &data) {
                                debug!(endpoint = %resolved, "SSE message endpoint announced");
                                *endpoint.write().await = Some(resolved);
                            } else {
                                warn!(endpoint = %data, "ignoring unresolvable SSE endpoint");
                            }
                        }
                        _ => match serde_json::from_str(&data) {
                            Ok(frame) => {
                                if tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding malformed SSE frame");
                            }
                        },
                    }
                }
            }

            let _ = tx
                .send(TransportEvent::Closed {
                    reason: Some("SSE stream ended".to_string()),
                })
                .await;
        });

        Ok(rx)
    }

    async fn send(&mut self, frame: serde_json::Value) -> UpstreamResult<()> {
        let endpoint = self.endpoint.read().await.clone();
        let Some(endpoint) = endpoint else {
            return Err(UpstreamError::SendFailed {
                message: "SSE server has not announced a message endpoint".to_string(),
            });
        };

        let response = self
            .apply_headers(self.client.post(&endpoint))
            .header("Content-Type", "application/json")
            .json(&frame)
            .send()
            .await
            .map_err(|e| UpstreamError::SendFailed {
                message: format!("SSE message POST failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(UpstreamError::SendFailed {
                message: format!("SSE message POST failed with status: {}", response.status()),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> UpstreamResult<()> {
        *self.endpoint.write().await = None;
        Ok(())
    }
}
