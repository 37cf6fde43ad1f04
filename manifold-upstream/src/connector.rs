//! Connector: one reliable MCP client connection per upstream

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use manifold_config::UpstreamDefaults;
use manifold_protocol::jsonrpc::id_text;
use manifold_protocol::messages::methods;
use manifold_protocol::{JsonRpcRequest, JsonRpcResponse, Tool, ToolsListResult, PROTOCOL_VERSION};

use crate::backoff::BackoffSchedule;
use crate::config::{TransportConfig, UpstreamConfig, UpstreamOptions};
use crate::error::{UpstreamError, UpstreamResult};
use crate::events::{UpstreamEvent, UpstreamStatus};
use crate::transport::{Transport, TransportEvent};

/// Factory used to build transports; swappable for tests
pub(crate) type TransportFactory = Arc<
    dyn Fn(&str, &TransportConfig, &UpstreamOptions) -> UpstreamResult<Box<dyn Transport>>
        + Send
        + Sync,
>;

/// Mutable connector state behind one lock
#[derive(Debug, Clone)]
struct ConnectorState {
    status: UpstreamStatus,
    last_error: Option<String>,
    last_seen_at: Option<DateTime<Utc>>,
}

/// One reliable MCP client connection to one upstream
///
/// Owns the transport, runs the handshake, correlates responses with pending
/// requests, and reconnects with exponential backoff. Request timeouts and
/// transport errors never kill the connector; they surface to the caller and,
/// for transport errors, drive the state machine.
pub struct Connector {
    id: String,
    config: RwLock<UpstreamConfig>,
    defaults: UpstreamDefaults,
    backoff: BackoffSchedule,
    factory: TransportFactory,

    state: RwLock<ConnectorState>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    pending: Mutex<std::collections::HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    tools: RwLock<Vec<Tool>>,

    events: broadcast::Sender<UpstreamEvent>,

    /// Set by an explicit stop; clears on the next start
    explicit_stop: AtomicBool,
    /// Bumped whenever the current connection is torn down; stale read loops
    /// and reconnect timers compare against it and bail out
    generation: AtomicU64,
    attempts: AtomicU32,
    internal_id: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(
        config: UpstreamConfig,
        defaults: UpstreamDefaults,
        events: broadcast::Sender<UpstreamEvent>,
    ) -> Arc<Self> {
        Self::with_factory(config, defaults, events, Arc::new(crate::transport::create))
    }

    pub(crate) fn with_factory(
        config: UpstreamConfig,
        defaults: UpstreamDefaults,
        events: broadcast::Sender<UpstreamEvent>,
        factory: TransportFactory,
    ) -> Arc<Self> {
        let backoff = BackoffSchedule::new(&defaults);
        Arc::new(Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            defaults,
            backoff,
            factory,
            state: RwLock::new(ConnectorState {
                status: UpstreamStatus::Stopped,
                last_error: None,
                last_seen_at: None,
            }),
            transport: Mutex::new(None),
            pending: Mutex::new(std::collections::HashMap::new()),
            tools: RwLock::new(Vec::new()),
            events,
            explicit_stop: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
            internal_id: AtomicU64::new(0),
            reconnect_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> UpstreamStatus {
        self.state.read().await.status
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_seen_at
    }

    pub async fn config(&self) -> UpstreamConfig {
        self.config.read().await.clone()
    }

    /// Cached tool descriptors from the last successful refresh
    pub async fn list_tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    /// Begin connecting; a no-op while already starting or running
    ///
    /// Cancels any pending reconnect timer and re-arms the attempt budget.
    pub async fn start(self: &Arc<Self>) {
        self.explicit_stop.store(false, Ordering::SeqCst);
        self.cancel_reconnect().await;
        self.attempts.store(0, Ordering::SeqCst);

        match self.status().await {
            UpstreamStatus::Starting | UpstreamStatus::Running => return,
            _ => {}
        }

        let connector = Arc::clone(self);
        tokio::spawn(Self::connect_cycle_boxed(connector));
    }

    /// Close the transport; with `explicit` set, refuse to auto-reconnect
    /// until the next `start`
    pub async fn stop(&self, explicit: bool) {
        if explicit {
            self.explicit_stop.store(true, Ordering::SeqCst);
            self.cancel_reconnect().await;
        }

        if self.status().await == UpstreamStatus::Stopped {
            return;
        }

        self.set_status(UpstreamStatus::Stopping, None).await;
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut transport) = self.transport.lock().await.take() {
            if let Err(e) = transport.close().await {
                warn!(upstream_id = %self.id, error = %e, "error closing transport");
            }
        }
        self.fail_pending().await;
        self.set_status(UpstreamStatus::Stopped, None).await;
    }

    /// Apply a new configuration
    ///
    /// Changed connection parameters force a stop-and-restart; anything else
    /// updates in place.
    pub async fn update_config(self: &Arc<Self>, new_config: UpstreamConfig) {
        let material = {
            let current = self.config.read().await;
            current.materially_differs(&new_config)
        };
        let enabled = new_config.enabled;
        *self.config.write().await = new_config;

        if material {
            info!(upstream_id = %self.id, "connection parameters changed, restarting");
            self.stop(false).await;
            if enabled {
                self.start().await;
            }
        }
    }

    /// Send a request and await its correlated response
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        id: Value,
    ) -> UpstreamResult<JsonRpcResponse> {
        if self.status().await != UpstreamStatus::Running {
            return Err(UpstreamError::NotReady {
                upstream_id: self.id.clone(),
            });
        }
        let timeout = self.request_timeout().await;
        self.send_request_inner(method, params, id, timeout).await
    }

    /// Forward a pre-built frame without awaiting anything
    pub async fn forward(&self, frame: Value) -> UpstreamResult<()> {
        if self.status().await != UpstreamStatus::Running {
            return Err(UpstreamError::NotReady {
                upstream_id: self.id.clone(),
            });
        }
        self.transport_send(frame).await
    }

    async fn request_timeout(&self) -> Duration {
        self.config
            .read()
            .await
            .options
            .request_timeout
            .unwrap_or(self.defaults.request_timeout)
    }

    fn next_internal_id(&self) -> Value {
        let n = self.internal_id.fetch_add(1, Ordering::Relaxed);
        json!(format!("manifold-int-{}", n))
    }

    async fn send_request_inner(
        &self,
        method: &str,
        params: Option<Value>,
        id: Value,
        timeout: Duration,
    ) -> UpstreamResult<JsonRpcResponse> {
        let key = id_text(&id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        let frame = serde_json::to_value(JsonRpcRequest::call(method, params, id))?;
        if let Err(e) = self.transport_send(frame).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Dropped sender: the connection went away under this request
            Ok(Err(_)) => Err(UpstreamError::NotReady {
                upstream_id: self.id.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(UpstreamError::RequestTimeout { timeout })
            }
        }
    }

    async fn transport_send(&self, frame: Value) -> UpstreamResult<()> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or_else(|| UpstreamError::NotReady {
            upstream_id: self.id.clone(),
        })?;
        transport.send(frame).await
    }

    /// One connect attempt, scheduling a retry on failure
    async fn connect_cycle(self: Arc<Self>) {
        if self.explicit_stop.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(UpstreamStatus::Starting, None).await;

        let connect_timeout = self.defaults.connect_timeout;
        let establish_fut: std::pin::Pin<
            Box<dyn std::future::Future<Output = UpstreamResult<()>> + Send + '_>,
        > = Box::pin(self.establish(generation));
        let result = tokio::time::timeout(connect_timeout, establish_fut).await;
        let result = match result {
            Ok(inner) => inner,
            Err(_) => Err(UpstreamError::ConnectionTimeout {
                timeout: connect_timeout,
            }),
        };

        match result {
            Ok(()) => {
                // A stop racing the handshake wins
                if self.generation.load(Ordering::SeqCst) != generation
                    || self.explicit_stop.load(Ordering::SeqCst)
                {
                    if let Some(mut transport) = self.transport.lock().await.take() {
                        let _ = transport.close().await;
                    }
                    return;
                }
                self.attempts.store(0, Ordering::SeqCst);
                self.set_status(UpstreamStatus::Running, None).await;
                info!(upstream_id = %self.id, "upstream connected");
                self.refresh_tools().await;
            }
            Err(e) => {
                if let Some(mut transport) = self.transport.lock().await.take() {
                    let _ = transport.close().await;
                }
                self.fail_pending().await;
                // A stop racing the attempt owns the state from here
                if self.generation.load(Ordering::SeqCst) != generation
                    || self.explicit_stop.load(Ordering::SeqCst)
                {
                    return;
                }
                warn!(upstream_id = %self.id, error = %e, "connect attempt failed");
                self.set_status(UpstreamStatus::Error, Some(e.to_string())).await;
                self.schedule_reconnect().await;
            }
        }
    }

    /// Open the transport and run the MCP handshake
    async fn establish(self: &Arc<Self>, generation: u64) -> UpstreamResult<()> {
        let (transport_config, options) = {
            let config = self.config.read().await;
            (config.transport.clone(), config.options.clone())
        };

        let mut transport = (self.factory)(&self.id, &transport_config, &options)?;
        let rx = transport.open().await?;
        *self.transport.lock().await = Some(transport);

        let connector = Arc::clone(self);
        tokio::spawn(async move {
            connector.read_loop(rx, generation).await;
        });

        // MCP handshake: initialize, then the initialized notification
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "manifold",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let response = self
            .send_request_inner(
                methods::INITIALIZE,
                Some(params),
                self.next_internal_id(),
                self.defaults.connect_timeout,
            )
            .await?;

        if let Some(error) = response.error {
            return Err(UpstreamError::Handshake {
                message: error.to_string(),
            });
        }

        let initialized = serde_json::to_value(JsonRpcRequest::notify(methods::INITIALIZED, None))?;
        self.transport_send(initialized).await?;

        Ok(())
    }

    /// Consume transport events for one connection generation
    async fn read_loop(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>, generation: u64) {
        loop {
            let event = rx.recv().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match event {
                Some(TransportEvent::Frame(frame)) => self.handle_frame(frame).await,
                Some(TransportEvent::Closed { reason }) => {
                    self.handle_transport_closed(reason).await;
                    return;
                }
                None => {
                    self.handle_transport_closed(None).await;
                    return;
                }
            }
        }
    }

    /// Route one incoming frame
    async fn handle_frame(self: &Arc<Self>, frame: Value) {
        self.state.write().await.last_seen_at = Some(Utc::now());

        let is_response = frame.get("method").is_none()
            && (frame.get("result").is_some() || frame.get("error").is_some());

        if is_response {
            if let Some(id) = frame.get("id") {
                let key = id_text(id);
                let sender = self.pending.lock().await.remove(&key);
                if let Some(sender) = sender {
                    match serde_json::from_value::<JsonRpcResponse>(frame) {
                        Ok(response) => {
                            let _ = sender.send(response);
                        }
                        Err(e) => {
                            warn!(upstream_id = %self.id, error = %e, "discarding malformed response");
                        }
                    }
                    return;
                }
            }
            // Uncorrelated responses fall through to the push path
        }

        if frame.get("method").and_then(Value::as_str) == Some(methods::TOOLS_LIST_CHANGED) {
            debug!(upstream_id = %self.id, "upstream tool list changed");
            let connector = Arc::clone(self);
            tokio::spawn(async move {
                connector.refresh_tools().await;
            });
        }

        self.emit(UpstreamEvent::PushMessage {
            upstream_id: self.id.clone(),
            message: frame,
        });
    }

    /// A transport close not initiated locally
    async fn handle_transport_closed(self: &Arc<Self>, reason: Option<String>) {
        self.fail_pending().await;
        if self.explicit_stop.load(Ordering::SeqCst) {
            return;
        }
        if self.status().await != UpstreamStatus::Running {
            return;
        }

        warn!(upstream_id = %self.id, reason = ?reason, "transport closed, reconnecting");
        *self.transport.lock().await = None;
        self.set_status(UpstreamStatus::Reconnecting, reason).await;
        self.schedule_reconnect().await;
    }

    /// Arm the backoff timer for the next attempt, or give up
    async fn schedule_reconnect(self: &Arc<Self>) {
        if self.explicit_stop.load(Ordering::SeqCst) {
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.backoff.max_attempts() {
            self.set_status(
                UpstreamStatus::Error,
                Some(format!("gave up after {} attempts", attempt - 1)),
            )
            .await;
            return;
        }

        let delay = self.backoff.delay(attempt);
        debug!(upstream_id = %self.id, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let connector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if connector.explicit_stop.load(Ordering::SeqCst) {
                return;
            }
            Self::connect_cycle_boxed(connector).await;
        });
        *self.reconnect_task.lock().await = Some(handle);
    }

    /// Boxed indirection around [`Self::connect_cycle`] to break the
    /// recursive opaque-type cycle between `connect_cycle` and `establish`
    /// that otherwise defeats rustc's auto-trait (`Send`) inference.
    fn connect_cycle_boxed(
        connector: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(connector.connect_cycle())
    }

    async fn cancel_reconnect(&self) {
        if let Some(handle) = self.reconnect_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Fetch the upstream's tools and publish the new set
    async fn refresh_tools(self: &Arc<Self>) {
        let timeout = self.request_timeout().await;
        let response = self
            .send_request_inner(methods::TOOLS_LIST, None, self.next_internal_id(), timeout)
            .await;

        let tools = match response {
            Ok(response) => match response.result {
                Some(result) => match serde_json::from_value::<ToolsListResult>(result) {
                    Ok(listing) => listing.tools,
                    Err(e) => {
                        warn!(upstream_id = %self.id, error = %e, "malformed tools/list result");
                        return;
                    }
                },
                None => {
                    warn!(upstream_id = %self.id, "tools/list answered with an error");
                    return;
                }
            },
            Err(e) => {
                warn!(upstream_id = %self.id, error = %e, "tools/list failed");
                return;
            }
        };

        debug!(upstream_id = %self.id, count = tools.len(), "refreshed tool list");
        *self.tools.write().await = tools.clone();
        self.emit(UpstreamEvent::ToolsChanged {
            upstream_id: self.id.clone(),
            tools,
        });
    }

    /// Abort every pending request with a closed-connection error
    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            drop(sender);
        }
    }

    async fn set_status(&self, new: UpstreamStatus, detail: Option<String>) {
        let old = {
            let mut state = self.state.write().await;
            let old = state.status;
            state.status = new;
            if detail.is_some() {
                state.last_error = detail.clone();
            } else if new == UpstreamStatus::Running {
                state.last_error = None;
            }
            old
        };
        if old != new {
            self.emit(UpstreamEvent::StatusChanged {
                upstream_id: self.id.clone(),
                old,
                new,
                detail,
            });
        }
    }

    fn emit(&self, event: UpstreamEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
