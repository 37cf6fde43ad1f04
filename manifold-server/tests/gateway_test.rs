//! End-to-end gateway tests against a scripted stdio upstream

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

use manifold_config::ManifoldConfig;
use manifold_server::auth::generate_key;
use manifold_server::Gateway;
use manifold_storage::{
    ApiKey, ApiKeyRepository, ManagedMcpServer, NewTrafficLog, ServerRepository, StorageResult,
    TrafficLogRepository,
};

/// Answers initialize, tools/list and tools/call like a real MCP server.
/// A tools/call whose arguments mention "notify" also emits a push
/// notification before the response.
const FAKE_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\("[^"]*"\|[0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{"listChanged":true}},"serverInfo":{"name":"fake-echo","version":"0.0.1"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"replies with pong","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      case "$line" in
        *notify*)
          printf '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}\n'
          ;;
      esac
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}\n' "$id"
      ;;
  esac
done
"#;

struct FakeKeyRepo {
    keys: Mutex<Vec<ApiKey>>,
}

#[async_trait]
impl ApiKeyRepository for FakeKeyRepo {
    async fn list_active(&self) -> StorageResult<Vec<ApiKey>> {
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn create(&self, key: &ApiKey) -> StorageResult<()> {
        self.keys.lock().unwrap().push(key.clone());
        Ok(())
    }

    async fn touch_last_used(&self, _id: &str, _at: DateTime<Utc>) -> StorageResult<()> {
        Ok(())
    }
}

struct FakeServerRepo {
    rows: Vec<ManagedMcpServer>,
}

#[async_trait]
impl ServerRepository for FakeServerRepo {
    async fn list_enabled(&self) -> StorageResult<Vec<ManagedMcpServer>> {
        Ok(self.rows.iter().filter(|r| r.is_enabled).cloned().collect())
    }

    async fn find_by_id(&self, id: &str) -> StorageResult<Option<ManagedMcpServer>> {
        Ok(self.rows.iter().find(|r| r.id == id).cloned())
    }

    async fn update_status(
        &self,
        _id: &str,
        _status: &str,
        _last_error: Option<&str>,
    ) -> StorageResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeTrafficRepo {
    rows: Mutex<Vec<NewTrafficLog>>,
}

#[async_trait]
impl TrafficLogRepository for FakeTrafficRepo {
    async fn insert(&self, record: NewTrafficLog) -> StorageResult<()> {
        self.rows.lock().unwrap().push(record);
        Ok(())
    }
}

struct TestGateway {
    base_url: String,
    client: reqwest::Client,
    traffic: Arc<FakeTrafficRepo>,
    /// Raw secret of the all-scopes key
    api_key: String,
    /// Raw secret of the list-only key
    list_only_key: String,
    _script_dir: tempfile::TempDir,
}

fn upstream_row(id: &str, name: &str, alias: &str, script: &str) -> ManagedMcpServer {
    let now = Utc::now();
    ManagedMcpServer {
        id: id.to_string(),
        name: name.to_string(),
        description: None,
        server_type: "stdio".to_string(),
        connection_details: json!({"command": "sh", "args": [script]}).to_string(),
        mcp_options: Some(json!({"alias": alias}).to_string()),
        status: "stopped".to_string(),
        is_enabled: true,
        tags: None,
        created_at: now,
        updated_at: now,
        last_pinged_at: None,
        last_error: None,
    }
}

async fn start_gateway(bypass: bool) -> TestGateway {
    let script_dir = tempfile::tempdir().unwrap();
    let script_path = script_dir.path().join("fake_mcp.sh");
    {
        let mut file = std::fs::File::create(&script_path).unwrap();
        file.write_all(FAKE_SERVER.as_bytes()).unwrap();
    }
    let script = script_path.to_str().unwrap().to_string();

    let (all_key, all_secret) = generate_key("all", None);
    let (list_key, list_secret) = generate_key("list-only", Some(vec!["tools:list".to_string()]));
    let key_repo = Arc::new(FakeKeyRepo {
        keys: Mutex::new(vec![all_key, list_key]),
    });

    let server_repo = Arc::new(FakeServerRepo {
        rows: vec![
            upstream_row("echo", "Echo Server", "echo", &script),
            upstream_row("other", "Other Server", "other", &script),
        ],
    });
    let traffic = Arc::new(FakeTrafficRepo::default());

    let mut config = ManifoldConfig::default();
    config.auth.bypass = bypass;
    config.gateway.keepalive_interval = Duration::from_secs(25);

    let gateway = Gateway::assemble(
        config,
        key_repo,
        server_repo,
        Arc::clone(&traffic) as Arc<dyn TrafficLogRepository>,
    )
    .await
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway.router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let test_gateway = TestGateway {
        base_url: format!("http://{}", addr),
        client: reqwest::Client::new(),
        traffic,
        api_key: all_secret,
        list_only_key: list_secret,
        _script_dir: script_dir,
    };

    // Wait until both upstreams contributed their tools
    for _ in 0..100 {
        let health: Value = test_gateway
            .client
            .get(format!("{}/health", test_gateway.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if health["tools"].as_u64().unwrap_or(0) >= 2 {
            return test_gateway;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("upstream tools never appeared in the catalog");
}

/// Extract the JSON payloads of every `data:` frame in an SSE body
fn sse_data_frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

async fn initialize_session(gw: &TestGateway, upstream: &str) -> String {
    let response = gw
        .client
        .post(format!("{}/mcp/{}", gw.base_url, upstream))
        .header("content-type", "application/json")
        .json(&json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .expect("initialize must hand out a session id")
        .to_str()
        .unwrap()
        .to_string();

    let body = response.text().await.unwrap();
    let frames = sse_data_frames(&body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["id"], 1);
    assert_eq!(frames[0]["result"]["serverInfo"]["name"], "manifold");

    session_id
}

#[tokio::test]
async fn test_initialize_list_call_flow() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    // tools/list returns the aggregated, namespaced catalog
    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let frames = sse_data_frames(&response.text().await.unwrap());
    let tools = frames[0]["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"echo__ping"));
    assert!(names.contains(&"other__ping"));

    // tools/call routes through the namespace to the right upstream
    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "echo__ping", "arguments": {"msg": "hi"}},
            "id": 3
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let frames = sse_data_frames(&response.text().await.unwrap());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["id"], 3);
    assert_eq!(frames[0]["result"]["content"][0]["text"], "pong");
}

#[tokio::test]
async fn test_batch_responses_preserve_order() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!([
            {"jsonrpc": "2.0", "method": "tools/list", "id": 1},
            {"jsonrpc": "2.0", "method": "tools/call", "params": {"name": "unknown__x"}, "id": 2}
        ]))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let frames = sse_data_frames(&response.text().await.unwrap());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["id"], 1);
    assert!(frames[0]["result"]["tools"].is_array());
    assert_eq!(frames[1]["id"], 2);
    assert_eq!(frames[1]["error"]["code"], -32601);
}

#[tokio::test]
async fn test_missing_credentials_return_401() {
    let gw = start_gateway(false).await;

    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .json(&json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32009);
}

#[tokio::test]
async fn test_valid_key_and_scope_enforcement() {
    let gw = start_gateway(false).await;

    // Full-scope key works end to end
    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .bearer_auth(&gw.api_key)
        .json(&json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session_id = response.headers()["mcp-session-id"].to_str().unwrap().to_string();

    // The list-only key cannot call tools: in-stream -32010 error frame
    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .bearer_auth(&gw.list_only_key)
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "echo__ping", "arguments": {}},
            "id": 2
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let frames = sse_data_frames(&response.text().await.unwrap());
    assert_eq!(frames[0]["error"]["code"], -32010);
}

#[tokio::test]
async fn test_session_is_scoped_to_its_upstream() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    let response = gw
        .client
        .post(format!("{}/mcp/other", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32011);
}

#[tokio::test]
async fn test_delete_terminates_the_session() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    let response = gw
        .client
        .delete(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    // Gone means gone
    let response = gw
        .client
        .delete(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": 9}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_notifications_only_post_returns_202() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 202);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_background_stream_requires_event_stream_accept() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    let response = gw
        .client
        .get(format!("{}/mcp/echo", gw.base_url))
        .header("accept", "application/json")
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 406);
}

#[tokio::test]
async fn test_push_fanout_reaches_only_owning_sessions() {
    let gw = start_gateway(true).await;
    let echo_session = initialize_session(&gw, "echo").await;
    let other_session = initialize_session(&gw, "other").await;

    // Background streams for both sessions; the session id rides the query
    // string for one of them to cover the fallback
    let echo_stream = gw
        .client
        .get(format!("{}/mcp/echo", gw.base_url))
        .header("accept", "text/event-stream")
        .header("mcp-session-id", &echo_session)
        .send()
        .await
        .unwrap();
    assert_eq!(echo_stream.status(), 200);

    let other_stream = gw
        .client
        .get(format!(
            "{}/mcp/other?mcpSessionId={}",
            gw.base_url, other_session
        ))
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(other_stream.status(), 200);

    // Trigger a push from the echo upstream
    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &echo_session)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "echo__ping", "arguments": {"notify": true}},
            "id": 5
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let _ = response.text().await.unwrap();

    // The echo session sees exactly the pushed notification
    let mut echo_body = echo_stream.bytes_stream();
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let frame: Value = loop {
        let chunk = tokio::time::timeout_at(deadline, echo_body.next())
            .await
            .expect("push frame never arrived")
            .expect("stream ended early")
            .unwrap();
        collected.push_str(std::str::from_utf8(&chunk).unwrap());
        if let Some(frame) = sse_data_frames(&collected).into_iter().next() {
            break frame;
        }
    };
    assert_eq!(frame["method"], "notifications/tools/list_changed");

    // The session on the other upstream sees nothing but comments
    let mut other_body = other_stream.bytes_stream();
    let mut other_collected = String::new();
    let quiet_until = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        match tokio::time::timeout_at(quiet_until, other_body.next()).await {
            Ok(Some(chunk)) => {
                other_collected.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
            }
            Ok(None) | Err(_) => break,
        }
    }
    assert!(sse_data_frames(&other_collected).is_empty());
}

#[tokio::test]
async fn test_health_and_stats_shapes() {
    let gw = start_gateway(true).await;

    let health: Value = gw
        .client
        .get(format!("{}/health", gw.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["tools"].as_u64().unwrap() >= 2);
    assert!(health["version"].is_string());

    let stats: Value = gw
        .client
        .get(format!("{}/stats", gw.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["activeSessions"].is_u64());
    assert!(stats["aggregatedTools"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn test_every_request_leaves_a_traffic_row() {
    let gw = start_gateway(true).await;
    let session_id = initialize_session(&gw, "echo").await;

    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}))
        .send()
        .await
        .unwrap();
    let _ = response.text().await.unwrap();

    // Audit writes are async; give the sink a moment
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rows = gw.traffic.rows.lock().unwrap();
    let initialize_rows: Vec<_> = rows
        .iter()
        .filter(|r| r.mcp_method.as_deref() == Some("initialize"))
        .collect();
    let list_rows: Vec<_> = rows
        .iter()
        .filter(|r| r.mcp_method.as_deref() == Some("tools/list"))
        .collect();

    assert_eq!(initialize_rows.len(), 1);
    assert!(initialize_rows[0].is_success);
    assert_eq!(list_rows.len(), 1);
    assert_eq!(list_rows[0].session_id.as_deref(), Some(session_id.as_str()));
}

#[tokio::test]
async fn test_unknown_upstream_is_404() {
    let gw = start_gateway(true).await;

    let response = gw
        .client
        .post(format!("{}/mcp/missing", gw.base_url))
        .json(&json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32006);
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let gw = start_gateway(true).await;

    let response = gw
        .client
        .post(format!("{}/mcp/echo", gw.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32700);
}
