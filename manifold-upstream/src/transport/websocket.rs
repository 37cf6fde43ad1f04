//! WebSocket transport: one JSON message per text frame

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use super::{Transport, TransportEvent, FRAME_CHANNEL_CAPACITY};
use crate::error::{UpstreamError, UpstreamResult};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket client transport
pub struct WebSocketTransport {
    url: String,
    headers: HashMap<String, String>,
    sink: Option<WsSink>,
}

impl WebSocketTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            sink: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self) -> UpstreamResult<mpsc::Receiver<TransportEvent>> {
        let mut request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|e| UpstreamError::Configuration {
                    message: format!("invalid websocket URL: {}", e),
                })?;

        for (name, value) in &self.headers {
            let name: http::header::HeaderName =
                name.parse().map_err(|_| UpstreamError::Configuration {
                    message: format!("invalid header name: {}", name),
                })?;
            let value = value.parse().map_err(|_| UpstreamError::Configuration {
                message: "invalid header value".to_string(),
            })?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) =
            connect_async(request)
                .await
                .map_err(|e| UpstreamError::ConnectionFailed {
                    message: format!("websocket connect failed: {}", e),
                })?;

        let (sink, mut reader) = stream.split();
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                        Ok(frame) => {
                            if tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "discarding malformed websocket frame");
                        }
                    },
                    Ok(Message::Binary(_)) => {
                        warn!("discarding binary websocket frame");
                    }
                    Ok(Message::Close(_)) => {
                        let _ = tx.send(TransportEvent::Closed { reason: None }).await;
                        return;
                    }
                    // Ping/pong are answered by tungstenite itself
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Closed {
                                reason: Some(format!("websocket error: {}", e)),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed { reason: None }).await;
        });

        self.sink = Some(sink);
        Ok(rx)
    }

    async fn send(&mut self, frame: serde_json::Value) -> UpstreamResult<()> {
        let sink = self.sink.as_mut().ok_or_else(|| UpstreamError::Transport {
            message: "transport not open".to_string(),
        })?;

        let json = serde_json::to_string(&frame)?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| UpstreamError::SendFailed {
                message: format!("websocket send failed: {}", e),
            })
    }

    async fn close(&mut self) -> UpstreamResult<()> {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        Ok(())
    }
}
