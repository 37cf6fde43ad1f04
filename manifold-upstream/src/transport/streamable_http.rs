//! Streamable-HTTP transport: JSON-RPC over POST with streamed answers
//!
//! Every outgoing frame is POSTed to the endpoint. The server answers each
//! POST with either a JSON body, an SSE body carrying one or more frames, or
//! 202 for notifications. The session id handed back on the initialize POST
//! is echoed on every later request, and a long-lived GET stream picks up
//! server-initiated frames once a session exists.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::{Transport, TransportEvent, FRAME_CHANNEL_CAPACITY};
use crate::error::{UpstreamError, UpstreamResult};

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable-HTTP client transport
pub struct StreamableHttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: Client,

    session_id: Arc<RwLock<Option<String>>>,
    frames: Option<mpsc::Sender<TransportEvent>>,
    /// Set once the background GET stream is running
    background_started: Arc<RwLock<bool>>,
}

impl StreamableHttpTransport {
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
            session_id: Arc::new(RwLock::new(None)),
            frames: None,
            background_started: Arc::new(RwLock::new(false)),
        })
    }

    fn base_headers(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (key, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                key.parse::<reqwest::header::HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            } else {
                warn!(header = %key, "skipping invalid upstream header");
            }
        }
        map
    }

    /// Feed every `data:` block of an SSE body into the frame channel
    async fn pump_sse_body(
        response: reqwest::Response,
        tx: mpsc::Sender<TransportEvent>,
        announce_close: bool,
    ) {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    if announce_close {
                        let _ = tx
                            .send(TransportEvent::Closed {
                                reason: Some(format!("stream error: {}", e)),
                            })
                            .await;
                    }
                    return;
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                warn!("discarding non-UTF-8 chunk");
                continue;
            };
            buffer.push_str(text);

            while let Some(boundary) = buffer.find("\n\n") {
                let raw_event = buffer[..boundary].to_string();
                buffer.drain(..boundary + 2);

                for line in raw_event.lines() {
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim_start();
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(data) {
                        Ok(frame) => {
                            if tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "discarding malformed frame");
                        }
                    }
                }
            }
        }

        if announce_close {
            let _ = tx.send(TransportEvent::Closed { reason: None }).await;
        }
    }

    /// Open the long-lived GET stream for server-initiated frames
    async fn start_background_stream(&self, session_id: String) {
        {
            let mut started = self.background_started.write().await;
            if *started {
                return;
            }
            *started = true;
        }

        let Some(tx) = self.frames.clone() else { return };
        let request = self
            .client
            .get(&self.url)
            .headers(self.base_headers())
            .header("Accept", "text/event-stream")
            .header(SESSION_HEADER, session_id);

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    Self::pump_sse_body(response, tx, true).await;
                }
                Ok(response) => {
                    // Servers without a push stream answer 405; that is fine
                    debug!(status = %response.status(), "background stream not available");
                }
                Err(e) => {
                    debug!(error = %e, "background stream connect failed");
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn open(&mut self) -> UpstreamResult<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        self.frames = Some(tx);
        *self.session_id.write().await = None;
        *self.background_started.write().await = false;
        Ok(rx)
    }

    async fn send(&mut self, frame: serde_json::Value) -> UpstreamResult<()> {
        let tx = self.frames.clone().ok_or_else(|| UpstreamError::Transport {
            message: "transport not open".to_string(),
        })?;

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.base_headers())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");

        if let Some(session_id) = self.session_id.read().await.clone() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .json(&frame)
            .send()
            .await
            .map_err(|e| UpstreamError::SendFailed {
                message: format!("POST failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(UpstreamError::SendFailed {
                message: format!("POST failed with status: {}", response.status()),
            });
        }

        // First successful POST carrying a session id pins the session
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        {
            let is_new = {
                let mut current = self.session_id.write().await;
                let is_new = current.as_deref() != Some(session_id.as_str());
                *current = Some(session_id.clone());
                is_new
            };
            if is_new {
                self.start_background_stream(session_id).await;
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Answers arrive as SSE frames on the POST body
            tokio::spawn(Self::pump_sse_body(response, tx, false));
        } else if content_type.starts_with("application/json") {
            let body = response.bytes().await.map_err(|e| UpstreamError::Transport {
                message: format!("failed to read response body: {}", e),
            })?;
            if !body.is_empty() {
                match serde_json::from_slice(&body) {
                    Ok(frame) => {
                        let _ = tx.send(TransportEvent::Frame(frame)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "discarding malformed response body");
                    }
                }
            }
        }
        // 202-style empty bodies carry nothing

        Ok(())
    }

    async fn close(&mut self) -> UpstreamResult<()> {
        let session_id = self.session_id.write().await.take();
        self.frames = None;

        // Tell the server the session is over, best effort
        if let Some(session_id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .headers(self.base_headers())
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
        }
        Ok(())
    }
}
