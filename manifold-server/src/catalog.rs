//! Tool aggregator: the namespaced, client-visible catalog

use arc_swap::ArcSwap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use manifold_protocol::Tool;
use manifold_upstream::{UpstreamEvent, UpstreamRegistry, UpstreamStatus};

/// One entry of the aggregated catalog
#[derive(Debug, Clone)]
pub struct ToolMapping {
    /// Gateway-visible, namespaced name
    pub gateway_name: String,
    /// Origin upstream
    pub upstream_id: String,
    /// Name the upstream knows the tool by
    pub original_name: String,
    /// Descriptor forwarded to clients, origin annotated
    pub tool: Tool,
}

/// Immutable catalog snapshot published to readers
#[derive(Default)]
struct CatalogSnapshot {
    by_name: HashMap<String, Arc<ToolMapping>>,
    /// Insertion order, for stable tools/list output
    ordered: Vec<Arc<ToolMapping>>,
}

/// Tool set contributed by one upstream
#[derive(Clone)]
struct UpstreamTools {
    upstream_id: String,
    namespace: String,
    tools: Vec<Tool>,
}

/// The aggregated catalog
///
/// Writers rebuild a fresh snapshot and publish it atomically; readers grab a
/// handle without taking a lock.
pub struct ToolCatalog {
    snapshot: ArcSwap<CatalogSnapshot>,
    /// Source sets in upstream insertion order; guards rebuilds
    sources: Mutex<Vec<UpstreamTools>>,
}

impl ToolCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::default()),
            sources: Mutex::new(Vec::new()),
        })
    }

    /// Replace one upstream's entries atomically
    pub async fn update_upstream(&self, upstream_id: &str, namespace: &str, tools: Vec<Tool>) {
        let mut sources = self.sources.lock().await;
        let entry = UpstreamTools {
            upstream_id: upstream_id.to_string(),
            namespace: namespace.to_string(),
            tools,
        };
        match sources.iter_mut().find(|s| s.upstream_id == upstream_id) {
            Some(existing) => *existing = entry,
            None => sources.push(entry),
        }
        self.publish(&sources);
    }

    /// Drop one upstream's entries
    pub async fn remove_upstream(&self, upstream_id: &str) {
        let mut sources = self.sources.lock().await;
        let before = sources.len();
        sources.retain(|s| s.upstream_id != upstream_id);
        if sources.len() != before {
            self.publish(&sources);
            debug!(upstream_id = %upstream_id, "removed upstream from catalog");
        }
    }

    /// Map a gateway tool name back to its origin
    pub fn resolve(&self, gateway_name: &str) -> Option<(String, String)> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_name
            .get(gateway_name)
            .map(|m| (m.upstream_id.clone(), m.original_name.clone()))
    }

    /// The full catalog as client-visible descriptors
    pub fn tools(&self) -> Vec<Tool> {
        let snapshot = self.snapshot.load();
        snapshot.ordered.iter().map(|m| m.tool.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build and publish a fresh snapshot from the current sources
    fn publish(&self, sources: &[UpstreamTools]) {
        let mut snapshot = CatalogSnapshot::default();

        for source in sources {
            let prefix = sanitize(&source.namespace);
            for tool in &source.tools {
                let base = format!("{}__{}", prefix, tool.name);
                let gateway_name = dedup_name(&snapshot.by_name, &base);

                let mut forwarded = tool.clone();
                forwarded.name = gateway_name.clone();
                forwarded
                    .metadata
                    .entry("_meta".to_string())
                    .or_insert_with(|| json!({}))
                    .as_object_mut()
                    .map(|meta| {
                        meta.insert("manifold/origin".to_string(), json!(source.upstream_id))
                    });

                let mapping = Arc::new(ToolMapping {
                    gateway_name: gateway_name.clone(),
                    upstream_id: source.upstream_id.clone(),
                    original_name: tool.name.clone(),
                    tool: forwarded,
                });
                snapshot.by_name.insert(gateway_name, Arc::clone(&mapping));
                snapshot.ordered.push(mapping);
            }
        }

        self.snapshot.store(Arc::new(snapshot));
    }

    /// Follow registry events, keeping the catalog in sync
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        registry: Arc<UpstreamRegistry>,
    ) -> JoinHandle<()> {
        let catalog = Arc::clone(self);
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(UpstreamEvent::ToolsChanged { upstream_id, tools }) => {
                        let Some(connector) = registry.connector(&upstream_id).await else {
                            continue;
                        };
                        let namespace = connector.config().await.namespace().to_string();
                        info!(upstream_id = %upstream_id, count = tools.len(), "catalog refresh");
                        catalog.update_upstream(&upstream_id, &namespace, tools).await;
                    }
                    Ok(UpstreamEvent::StatusChanged { upstream_id, new, .. }) => {
                        if new != UpstreamStatus::Running {
                            catalog.remove_upstream(&upstream_id).await;
                        }
                    }
                    Ok(UpstreamEvent::PushMessage { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "catalog fell behind the event bus, resyncing");
                        catalog.resync(&registry).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Rebuild from registry state after missing events
    async fn resync(&self, registry: &UpstreamRegistry) {
        let statuses = registry.statuses().await;
        for (upstream_id, status) in statuses {
            if status == UpstreamStatus::Running {
                if let Some(connector) = registry.connector(&upstream_id).await {
                    let namespace = connector.config().await.namespace().to_string();
                    let tools = connector.list_tools().await;
                    self.update_upstream(&upstream_id, &namespace, tools).await;
                }
            } else {
                self.remove_upstream(&upstream_id).await;
            }
        }
    }
}

/// Namespace sanitizer: whitespace to underscores, strip everything outside
/// `[A-Za-z0-9_]`, lowercase
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

/// Append `__2`, `__3`, ... until the name is free
fn dedup_name(taken: &HashMap<String, Arc<ToolMapping>>, base: &str) -> String {
    if !taken.contains_key(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}__{}", base, n);
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
