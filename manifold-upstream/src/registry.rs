//! Registry: the single owner of every connector

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use manifold_config::UpstreamDefaults;

use crate::config::UpstreamConfig;
use crate::connector::Connector;
use crate::events::{UpstreamEvent, UpstreamStatus};

/// Capacity of the registry event bus
const EVENT_BUS_CAPACITY: usize = 1024;

/// Holds all connectors keyed by upstream id and publishes the event bus
///
/// At most one live connector exists per upstream id. Other components reach
/// upstream state exclusively through this registry and its events.
pub struct UpstreamRegistry {
    connectors: RwLock<HashMap<String, Arc<Connector>>>,
    events: broadcast::Sender<UpstreamEvent>,
    defaults: UpstreamDefaults,
}

impl UpstreamRegistry {
    pub fn new(defaults: UpstreamDefaults) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Arc::new(Self {
            connectors: RwLock::new(HashMap::new()),
            events,
            defaults,
        })
    }

    /// Subscribe to upstream events
    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    /// Register an upstream, starting a connector when it is enabled
    ///
    /// Re-registering an existing id reconfigures the live connector instead
    /// of creating a second one.
    pub async fn register(&self, config: UpstreamConfig) -> Arc<Connector> {
        let id = config.id.clone();
        let existing = self.connectors.read().await.get(&id).cloned();

        if let Some(connector) = existing {
            let enabled = config.enabled;
            connector.update_config(config).await;
            if !enabled {
                connector.stop(true).await;
            } else if connector.status().await == UpstreamStatus::Stopped {
                connector.start().await;
            }
            return connector;
        }

        let enabled = config.enabled;
        let connector = Connector::new(config, self.defaults.clone(), self.events.clone());
        self.connectors
            .write()
            .await
            .insert(id.clone(), Arc::clone(&connector));

        if enabled {
            connector.start().await;
        }
        info!(upstream_id = %id, enabled, "registered upstream");
        connector
    }

    /// Stop and drop an upstream's connector
    pub async fn remove(&self, upstream_id: &str) {
        let connector = self.connectors.write().await.remove(upstream_id);
        if let Some(connector) = connector {
            connector.stop(true).await;
            info!(upstream_id = %upstream_id, "removed upstream");
        }
    }

    /// Look up a connector handle
    pub async fn connector(&self, upstream_id: &str) -> Option<Arc<Connector>> {
        self.connectors.read().await.get(upstream_id).cloned()
    }

    /// Whether an upstream id is registered at all
    pub async fn contains(&self, upstream_id: &str) -> bool {
        self.connectors.read().await.contains_key(upstream_id)
    }

    /// Restart an upstream's connection in place
    ///
    /// Used by the dev-watcher after its child's sources change.
    pub async fn restart(&self, upstream_id: &str) {
        let Some(connector) = self.connector(upstream_id).await else {
            warn!(upstream_id = %upstream_id, "restart requested for unknown upstream");
            return;
        };
        connector.stop(false).await;
        connector.start().await;
    }

    /// Current status of every registered upstream
    pub async fn statuses(&self) -> Vec<(String, UpstreamStatus)> {
        let connectors = self.connectors.read().await;
        let mut statuses = Vec::with_capacity(connectors.len());
        for (id, connector) in connectors.iter() {
            statuses.push((id.clone(), connector.status().await));
        }
        statuses
    }

    /// Number of registered upstreams
    pub async fn len(&self) -> usize {
        self.connectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connectors.read().await.is_empty()
    }

    /// Stop every connector; used on shutdown
    pub async fn shutdown(&self) {
        let connectors: Vec<_> = self.connectors.write().await.drain().collect();
        for (id, connector) in connectors {
            connector.stop(true).await;
            info!(upstream_id = %id, "stopped upstream");
        }
    }
}
