//! The gateway endpoint: `/mcp/{upstream_id}` plus health and stats

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use manifold_protocol::jsonrpc::{id_text, parse_frames};
use manifold_protocol::messages::methods;
use manifold_protocol::{
    ClientCapabilities, GatewayError, GatewayResult, InitializeParams, InitializeResult,
    JsonRpcFrame, JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo,
    ToolsCallParams, ToolsCapability, ToolsListResult, PROTOCOL_VERSION,
};
use manifold_storage::NewTrafficLog;
use manifold_upstream::UpstreamEvent;

use crate::auth::{AuthContext, SCOPE_CONNECT, SCOPE_TOOLS_CALL, SCOPE_TOOLS_LIST};
use crate::session::{PushQueue, Session};
use crate::state::AppState;

/// Session header name (requests are matched case-insensitively)
pub const SESSION_HEADER: &str = "mcp-session-id";
/// Query fallback for the background stream
const SESSION_QUERY_PARAM: &str = "mcpSessionId";

/// Request metadata threaded into audit rows
#[derive(Clone)]
struct RequestMeta {
    upstream_id: String,
    source_ip: Option<String>,
    api_key_id: Option<String>,
    session_id: Option<String>,
}

// === POST ===

pub async fn mcp_post(
    State(state): State<AppState>,
    Path(upstream_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let meta = RequestMeta {
        upstream_id: upstream_id.clone(),
        source_ip: Some(peer.ip().to_string()),
        api_key_id: None,
        session_id: None,
    };

    match handle_post(&state, upstream_id, &headers, &body, meta.clone()).await {
        Ok(response) => response,
        Err(err) => {
            state.audit.record(NewTrafficLog {
                server_id: Some(meta.upstream_id),
                source_ip: meta.source_ip,
                request_size_bytes: Some(body.len() as i64),
                http_status: Some(err.status_code().as_u16() as i64),
                is_success: false,
                error_message: Some(err.to_string()),
                ..Default::default()
            });
            err.into_response()
        }
    }
}

async fn handle_post(
    state: &AppState,
    upstream_id: String,
    headers: &HeaderMap,
    body: &Bytes,
    mut meta: RequestMeta,
) -> GatewayResult<Response> {
    if !state.registry.contains(&upstream_id).await {
        return Err(GatewayError::ResourceNotFound {
            resource: format!("upstream '{}'", upstream_id),
        });
    }

    let (frames, _batch) = parse_frames(body).map_err(|e| GatewayError::Parse {
        message: e.to_string(),
    })?;
    if frames.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "empty batch".to_string(),
        });
    }

    let has_request = frames.iter().any(JsonRpcFrame::is_request);

    // Pure notifications and responses: forward and acknowledge
    if !has_request {
        let session = require_session(state, headers, &upstream_id).await?;
        session.touch().await;
        meta.session_id = Some(session.id.clone());
        meta.api_key_id = session.api_key_id.clone();

        let first_method = frames.first().and_then(|f| f.method().map(str::to_string));
        forward_frames(state, &session, frames);

        state.audit.record(NewTrafficLog {
            server_id: Some(meta.upstream_id.clone()),
            mcp_method: first_method,
            source_ip: meta.source_ip.clone(),
            session_id: meta.session_id.clone(),
            api_key_id: meta.api_key_id.clone(),
            request_size_bytes: Some(body.len() as i64),
            http_status: Some(StatusCode::ACCEPTED.as_u16() as i64),
            is_success: true,
            ..Default::default()
        });
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let context = state.auth.authenticate(headers).await?;
    meta.api_key_id = context.api_key_id.clone();

    let first_request = frames
        .iter()
        .find(|f| f.is_request())
        .and_then(|f| match f {
            JsonRpcFrame::Request(r) => Some(r),
            JsonRpcFrame::Response(_) => None,
        })
        .cloned()
        .ok_or_else(|| GatewayError::InvalidRequest {
            message: "no request in batch".to_string(),
        })?;

    let is_initialize = first_request.method == methods::INITIALIZE;

    let session = if is_initialize {
        // A fresh session regardless of any id the client presented
        state.auth.require_scope(&context, SCOPE_CONNECT)?;
        let capabilities = first_request
            .params
            .clone()
            .and_then(|p| serde_json::from_value::<InitializeParams>(p).ok())
            .map(|p| p.capabilities)
            .unwrap_or_else(ClientCapabilities::default);
        state
            .sessions
            .create(&upstream_id, context.api_key_id.clone(), capabilities)
            .await?
    } else {
        let session = require_session(state, headers, &upstream_id).await?;
        session.touch().await;
        session
    };
    meta.session_id = Some(session.id.clone());

    // Answers stream back in request order, one SSE event per response.
    // Dropping the body (client disconnect) cancels whatever is left of
    // the batch.
    let stream = {
        let state = state.clone();
        let session = Arc::clone(&session);
        let meta = meta.clone();
        async_stream::stream! {
            for frame in frames {
                match frame {
                    JsonRpcFrame::Request(request) if request.expects_response() => {
                        let started = Instant::now();
                        let method = request.method.clone();
                        let request_id = request.id.as_ref().map(id_text);

                        let (response, routed_upstream) = dispatch(&state, &context, request).await;

                        let is_success = !response.is_error();
                        let error_message = response.error.as_ref().map(|e| e.message.clone());
                        let payload = match serde_json::to_string(&response) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize response");
                                continue;
                            }
                        };

                        state.audit.record(NewTrafficLog {
                            server_id: Some(routed_upstream.unwrap_or_else(|| meta.upstream_id.clone())),
                            mcp_method: Some(method),
                            mcp_request_id: request_id,
                            source_ip: meta.source_ip.clone(),
                            session_id: meta.session_id.clone(),
                            api_key_id: meta.api_key_id.clone(),
                            response_size_bytes: Some(payload.len() as i64),
                            http_status: Some(StatusCode::OK.as_u16() as i64),
                            is_success,
                            duration_ms: Some(started.elapsed().as_millis() as i64),
                            error_message,
                            ..Default::default()
                        });

                        yield Ok::<Event, Infallible>(Event::default().data(payload));
                    }
                    other => {
                        // Notifications and responses inside a mixed batch are
                        // forwarded without an answer event
                        forward_frames(&state, &session, vec![other]);
                    }
                }
            }
        }
    };

    let mut response = Sse::new(stream).into_response();
    if is_initialize {
        if let Ok(value) = HeaderValue::from_str(&session.id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    Ok(response)
}

/// Route one request to its answer
async fn dispatch(
    state: &AppState,
    context: &AuthContext,
    request: JsonRpcRequest,
) -> (JsonRpcResponse, Option<String>) {
    let id = request.id.clone();
    match dispatch_inner(state, context, request).await {
        Ok((response, routed)) => (response, routed),
        Err(err) => (JsonRpcResponse::failure(id, err.to_rpc_error()), None),
    }
}

async fn dispatch_inner(
    state: &AppState,
    context: &AuthContext,
    request: JsonRpcRequest,
) -> GatewayResult<(JsonRpcResponse, Option<String>)> {
    let id = request.id.clone();

    match request.method.as_str() {
        methods::INITIALIZE => {
            state.auth.require_scope(context, SCOPE_CONNECT)?;
            let result = InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability {
                        list_changed: Some(true),
                    }),
                    other: HashMap::new(),
                },
                server_info: ServerInfo {
                    name: "manifold".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    metadata: HashMap::new(),
                },
            };
            let result = serde_json::to_value(result).map_err(|e| GatewayError::internal(e.to_string()))?;
            Ok((JsonRpcResponse::result(id, result), None))
        }

        methods::PING => Ok((JsonRpcResponse::result(id, json!({})), None)),

        methods::TOOLS_LIST => {
            state.auth.require_scope(context, SCOPE_TOOLS_LIST)?;
            // Always answered from the aggregated catalog
            let result = ToolsListResult {
                tools: state.catalog.tools(),
                next_cursor: None,
            };
            let result = serde_json::to_value(result).map_err(|e| GatewayError::internal(e.to_string()))?;
            Ok((JsonRpcResponse::result(id, result), None))
        }

        methods::TOOLS_CALL => {
            state.auth.require_scope(context, SCOPE_TOOLS_CALL)?;
            let params: ToolsCallParams = request
                .params
                .clone()
                .ok_or_else(|| GatewayError::InvalidParams {
                    message: "tools/call requires params".to_string(),
                })
                .and_then(|p| {
                    serde_json::from_value(p).map_err(|e| GatewayError::InvalidParams {
                        message: e.to_string(),
                    })
                })?;

            let (upstream_id, original_name) =
                state
                    .catalog
                    .resolve(&params.name)
                    .ok_or_else(|| GatewayError::MethodNotFound {
                        method: params.name.clone(),
                    })?;

            let connector = state.registry.connector(&upstream_id).await.ok_or_else(|| {
                GatewayError::ResourceNotFound {
                    resource: format!("upstream '{}'", upstream_id),
                }
            })?;

            let inner_params = json!({
                "name": original_name,
                "arguments": params.arguments.unwrap_or(Value::Null),
            });
            let request_id = id.clone().unwrap_or_else(|| json!(null));
            let mut response = connector
                .send_request(methods::TOOLS_CALL, Some(inner_params), request_id)
                .await
                .map_err(GatewayError::from)?;

            // The upstream's result or error object passes through verbatim
            response.id = id;
            Ok((response, Some(upstream_id)))
        }

        other => Err(GatewayError::MethodNotFound {
            method: other.to_string(),
        }),
    }
}

/// Fire-and-forget forwarding of notifications and responses
fn forward_frames(state: &AppState, session: &Arc<Session>, frames: Vec<JsonRpcFrame>) {
    let registry = Arc::clone(&state.registry);
    let upstream_id = session.upstream_id.clone();

    for frame in frames {
        // The client's initialized notification settles at the gateway
        if frame.method() == Some(methods::INITIALIZED) {
            continue;
        }
        let registry = Arc::clone(&registry);
        let upstream_id = upstream_id.clone();
        tokio::spawn(async move {
            let Some(connector) = registry.connector(&upstream_id).await else {
                return;
            };
            let value = match &frame {
                JsonRpcFrame::Request(r) => serde_json::to_value(r),
                JsonRpcFrame::Response(r) => serde_json::to_value(r),
            };
            match value {
                Ok(value) => {
                    if let Err(e) = connector.forward(value).await {
                        debug!(upstream_id = %upstream_id, error = %e, "dropped forwarded frame");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize forwarded frame"),
            }
        });
    }
}

/// Resolve the session named in headers and enforce its upstream binding
async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
    upstream_id: &str,
) -> GatewayResult<Arc<Session>> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::SessionNotFound)?;
    state.sessions.get_for_upstream(session_id, upstream_id).await
}

// === GET: background push stream ===

/// Detaches the background stream when the response body goes away,
/// whether the queue drained normally or the client disconnected
struct BackgroundStreamGuard {
    session: Arc<Session>,
    queue: Arc<PushQueue>,
}

impl Drop for BackgroundStreamGuard {
    fn drop(&mut self) {
        self.queue.close();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = Arc::clone(&self.session);
            let queue = Arc::clone(&self.queue);
            handle.spawn(async move {
                session.detach_push(&queue).await;
            });
        }
    }
}

pub async fn mcp_get(
    State(state): State<AppState>,
    Path(upstream_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    match handle_get(&state, upstream_id, &headers, &query).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_get(
    state: &AppState,
    upstream_id: String,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> GatewayResult<Response> {
    let accepts_event_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream") || accept.contains("*/*"));
    if !accepts_event_stream {
        return Ok(StatusCode::NOT_ACCEPTABLE.into_response());
    }

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get(SESSION_QUERY_PARAM).map(String::as_str))
        .ok_or(GatewayError::SessionNotFound)?;

    let session = state
        .sessions
        .get_for_upstream(session_id, &upstream_id)
        .await?;
    session.touch().await;

    // This stream becomes the session's one background stream
    let queue = PushQueue::new(state.sessions.push_queue_depth());
    session.attach_push(Arc::clone(&queue)).await;

    let guard = BackgroundStreamGuard {
        session: Arc::clone(&session),
        queue: Arc::clone(&queue),
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<Event, Infallible>(Event::default().comment("background stream open"));
        loop {
            match queue.pop().await {
                Some(frame) => match serde_json::to_string(&frame) {
                    Ok(payload) => yield Ok(Event::default().data(payload)),
                    Err(e) => warn!(error = %e, "failed to serialize push frame"),
                },
                // Session deleted, expired, or stream evicted
                None => break,
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.gateway.keepalive_interval)
                .text("keepalive"),
        )
        .into_response())
}

// === DELETE: terminate the session ===

pub async fn mcp_delete(
    State(state): State<AppState>,
    Path(upstream_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match handle_delete(&state, upstream_id, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_delete(
    state: &AppState,
    upstream_id: String,
    headers: &HeaderMap,
) -> GatewayResult<Response> {
    let session = require_session(state, headers, &upstream_id).await?;
    state.sessions.delete(&session.id).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// === Health and stats ===

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.count().await,
        "tools": state.catalog.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "activeSessions": state.sessions.count().await,
        "aggregatedTools": state.catalog.len(),
    }))
}

// === Upstream push fan-out ===

/// Deliver upstream pushes to every owning session's background stream
pub fn spawn_push_fanout(state: AppState) -> JoinHandle<()> {
    let mut events = state.registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UpstreamEvent::PushMessage {
                    upstream_id,
                    message,
                }) => {
                    let frame = into_jsonrpc(message);
                    for session in state.sessions.for_upstream(&upstream_id).await {
                        if let Some(queue) = session.push_queue().await {
                            queue.push(frame.clone()).await;
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "push fan-out fell behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Ensure a pushed frame carries the JSON-RPC version marker
fn into_jsonrpc(mut message: Value) -> Value {
    if let Some(object) = message.as_object_mut() {
        object
            .entry("jsonrpc")
            .or_insert_with(|| json!(manifold_protocol::JSONRPC_VERSION));
    }
    message
}
