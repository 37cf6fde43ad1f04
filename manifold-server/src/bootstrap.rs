//! Wiring: storage, registry, catalog, sessions, auth, audit, router

use anyhow::Context;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use manifold_config::ManifoldConfig;
use manifold_storage::{
    ApiKeyRepository, Database, ManagedMcpServer, ServerRepository, SqlApiKeyRepository,
    SqlServerRepository, SqlTrafficLogRepository, TrafficLogRepository,
};
use manifold_upstream::{
    DevWatcher, TransportConfig, UpstreamConfig, UpstreamEvent, UpstreamOptions, UpstreamRegistry,
};

use crate::audit::AuditSink;
use crate::auth::AuthService;
use crate::catalog::ToolCatalog;
use crate::gateway;
use crate::router::build_router;
use crate::session::SessionStore;
use crate::state::AppState;

/// The assembled gateway
pub struct Gateway {
    pub state: AppState,
    handles: Vec<JoinHandle<()>>,
    watcher: Option<DevWatcher>,
}

impl Gateway {
    /// Build against the configured database
    pub async fn build(config: ManifoldConfig) -> anyhow::Result<Self> {
        let db = Database::connect(&config.database)
            .await
            .context("database connection failed")?;
        db.migrate().await.context("schema migration failed")?;

        let key_repo: Arc<dyn ApiKeyRepository> = Arc::new(SqlApiKeyRepository::new(db.clone()));
        let server_repo: Arc<dyn ServerRepository> = Arc::new(SqlServerRepository::new(db.clone()));
        let traffic_repo: Arc<dyn TrafficLogRepository> =
            Arc::new(SqlTrafficLogRepository::new(db));

        Self::assemble(config, key_repo, server_repo, traffic_repo).await
    }

    /// Build from explicit repositories; tests inject fakes here
    pub async fn assemble(
        config: ManifoldConfig,
        key_repo: Arc<dyn ApiKeyRepository>,
        server_repo: Arc<dyn ServerRepository>,
        traffic_repo: Arc<dyn TrafficLogRepository>,
    ) -> anyhow::Result<Self> {
        let registry = UpstreamRegistry::new(config.upstream.clone());
        let catalog = ToolCatalog::new();
        let sessions = SessionStore::new(&config.gateway);
        let auth = AuthService::new(key_repo, config.auth.bypass);
        let audit = AuditSink::new(traffic_repo);

        let state = AppState {
            registry: Arc::clone(&registry),
            catalog: Arc::clone(&catalog),
            sessions: Arc::clone(&sessions),
            auth,
            audit,
            gateway: Arc::new(config.gateway.clone()),
        };

        // Subscribers come up before the first connector so no event is missed
        let handles = vec![
            catalog.spawn_refresh_task(Arc::clone(&registry)),
            sessions.spawn_cleanup(),
            gateway::spawn_push_fanout(state.clone()),
            spawn_status_mirror(Arc::clone(&registry), Arc::clone(&server_repo)),
        ];

        for row in server_repo
            .list_enabled()
            .await
            .context("loading upstreams")?
        {
            match upstream_config_from_row(&row) {
                Ok(upstream) => {
                    registry.register(upstream).await;
                }
                Err(e) => {
                    warn!(upstream_id = %row.id, error = %e, "skipping unparseable upstream row");
                }
            }
        }

        let watcher = match config.watcher {
            Some(watcher_config) => DevWatcher::spawn(watcher_config, Arc::clone(&registry))
                .context("starting dev-watcher")?,
            None => None,
        };

        Ok(Self {
            state,
            handles,
            watcher,
        })
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind and serve until interrupted, then tear down cleanly
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(addr = %addr, "gateway listening");

        let router = self.router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

        self.shutdown().await;
        Ok(())
    }

    /// Stop connectors and background tasks
    pub async fn shutdown(self) {
        if let Some(watcher) = self.watcher {
            watcher.stop();
        }
        self.state.registry.shutdown().await;
        for handle in self.handles {
            handle.abort();
        }
        info!("gateway stopped");
    }
}

/// Mirror connector status transitions into the upstream rows, best effort
fn spawn_status_mirror(
    registry: Arc<UpstreamRegistry>,
    server_repo: Arc<dyn ServerRepository>,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UpstreamEvent::StatusChanged {
                    upstream_id,
                    new,
                    detail,
                    ..
                }) => {
                    if let Err(e) = server_repo
                        .update_status(&upstream_id, new.as_str(), detail.as_deref())
                        .await
                    {
                        warn!(upstream_id = %upstream_id, error = %e, "status mirror write failed");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Options column shape: connector options plus the namespacing alias
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RowOptions {
    alias: Option<String>,

    #[serde(flatten)]
    options: UpstreamOptions,
}

/// Decode one `managed_mcp_server` row into connector configuration
pub fn upstream_config_from_row(row: &ManagedMcpServer) -> anyhow::Result<UpstreamConfig> {
    let mut details: Value = serde_json::from_str(&row.connection_details)
        .context("connection_details is not valid JSON")?;

    // Older rows keep the discriminant only in server_type
    if let Some(object) = details.as_object_mut() {
        object
            .entry("type".to_string())
            .or_insert_with(|| json!(row.server_type));
    }

    let transport: TransportConfig =
        serde_json::from_value(details).context("connection_details does not match server_type")?;

    let row_options: RowOptions = match row.mcp_options.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(raw).context("mcp_options is not valid JSON")?
        }
        _ => RowOptions::default(),
    };

    Ok(UpstreamConfig {
        id: row.id.clone(),
        name: row.name.clone(),
        alias: row_options.alias,
        transport,
        options: row_options.options,
        enabled: row.is_enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(server_type: &str, details: &str, options: Option<&str>) -> ManagedMcpServer {
        let now = Utc::now();
        ManagedMcpServer {
            id: "u1".to_string(),
            name: "Echo Server".to_string(),
            description: None,
            server_type: server_type.to_string(),
            connection_details: details.to_string(),
            mcp_options: options.map(str::to_string),
            status: "stopped".to_string(),
            is_enabled: true,
            tags: None,
            created_at: now,
            updated_at: now,
            last_pinged_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_stdio_row_decodes() {
        let row = row(
            "stdio",
            r#"{"command": "echo-server", "args": ["--fast"]}"#,
            Some(r#"{"alias": "echo", "request_timeout": "10s"}"#),
        );
        let config = upstream_config_from_row(&row).unwrap();

        assert_eq!(config.namespace(), "echo");
        assert_eq!(
            config.options.request_timeout,
            Some(std::time::Duration::from_secs(10))
        );
        match config.transport {
            TransportConfig::Stdio { command, args, .. } => {
                assert_eq!(command, "echo-server");
                assert_eq!(args, vec!["--fast"]);
            }
            other => panic!("wrong transport: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_type_tag_wins() {
        let row = row(
            "stdio",
            r#"{"type": "websocket", "url": "wss://example.com/mcp"}"#,
            None,
        );
        let config = upstream_config_from_row(&row).unwrap();
        assert!(matches!(config.transport, TransportConfig::Websocket { .. }));
    }

    #[test]
    fn test_malformed_details_are_rejected() {
        let row = row("stdio", "not json", None);
        assert!(upstream_config_from_row(&row).is_err());
    }

    #[test]
    fn test_missing_options_defaults() {
        let row = row("sse", r#"{"url": "https://example.com/sse"}"#, None);
        let config = upstream_config_from_row(&row).unwrap();
        assert_eq!(config.alias, None);
        assert_eq!(config.namespace(), "Echo Server");
        assert_eq!(config.options.request_timeout, None);
    }
}
