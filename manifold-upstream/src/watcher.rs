//! Dev-watcher: restart stdio upstreams when their sources change

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use manifold_config::WatcherConfig;

use crate::error::{UpstreamError, UpstreamResult};
use crate::registry::UpstreamRegistry;

/// Filesystem watcher that restarts upstream child processes on change
///
/// Bursts of events within the coalescing window collapse into one restart
/// per affected upstream.
pub struct DevWatcher {
    handle: JoinHandle<()>,
    // The OS watcher stops when dropped
    _watcher: RecommendedWatcher,
}

impl DevWatcher {
    /// Start watching; returns `None` when disabled or targetless
    pub fn spawn(
        config: WatcherConfig,
        registry: Arc<UpstreamRegistry>,
    ) -> UpstreamResult<Option<Self>> {
        if !config.enabled || config.targets.is_empty() {
            return Ok(None);
        }

        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            })
            .map_err(|e| UpstreamError::Configuration {
                message: format!("failed to create filesystem watcher: {}", e),
            })?;

        for target in &config.targets {
            watcher
                .watch(&target.path, RecursiveMode::Recursive)
                .map_err(|e| UpstreamError::Configuration {
                    message: format!("failed to watch {}: {}", target.path.display(), e),
                })?;
            info!(
                upstream_id = %target.upstream_id,
                path = %target.path.display(),
                "watching for changes"
            );
        }

        let targets: Vec<(String, PathBuf)> = config
            .targets
            .iter()
            .map(|t| (t.upstream_id.clone(), t.path.clone()))
            .collect();
        let debounce = config.debounce;

        let handle = tokio::spawn(Self::run(rx, targets, debounce, registry));

        Ok(Some(Self {
            handle,
            _watcher: watcher,
        }))
    }

    /// Consume events, coalesce bursts, restart affected upstreams
    async fn run(
        mut rx: mpsc::UnboundedReceiver<Event>,
        targets: Vec<(String, PathBuf)>,
        debounce: std::time::Duration,
        registry: Arc<UpstreamRegistry>,
    ) {
        while let Some(event) = rx.recv().await {
            let mut affected = HashSet::new();
            collect_affected(&event, &targets, &mut affected);

            // Coalesce the burst
            loop {
                match tokio::time::timeout(debounce, rx.recv()).await {
                    Ok(Some(event)) => collect_affected(&event, &targets, &mut affected),
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            for upstream_id in affected {
                info!(upstream_id = %upstream_id, "source change detected, restarting upstream");
                registry.restart(&upstream_id).await;
            }
        }
    }

    /// Stop the watcher
    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Record which upstreams an event touches
fn collect_affected(event: &Event, targets: &[(String, PathBuf)], affected: &mut HashSet<String>) {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }

    for path in &event.paths {
        for (upstream_id, watch_path) in targets {
            if path.starts_with(watch_path) {
                debug!(upstream_id = %upstream_id, path = %path.display(), "change event");
                affected.insert(upstream_id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_config::UpstreamDefaults;
    use notify::event::{CreateKind, Event, EventAttributes, EventKind};

    fn targets() -> Vec<(String, PathBuf)> {
        vec![
            ("u1".to_string(), PathBuf::from("/srv/one")),
            ("u2".to_string(), PathBuf::from("/srv/two")),
        ]
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: EventAttributes::default(),
        }
    }

    #[test]
    fn test_affected_matches_by_prefix() {
        let mut affected = HashSet::new();
        collect_affected(
            &event(EventKind::Create(CreateKind::File), "/srv/one/main.py"),
            &targets(),
            &mut affected,
        );
        assert_eq!(affected.len(), 1);
        assert!(affected.contains("u1"));
    }

    #[test]
    fn test_unrelated_paths_are_ignored() {
        let mut affected = HashSet::new();
        collect_affected(
            &event(EventKind::Create(CreateKind::File), "/tmp/elsewhere"),
            &targets(),
            &mut affected,
        );
        assert!(affected.is_empty());
    }

    #[test]
    fn test_access_events_are_ignored() {
        let mut affected = HashSet::new();
        collect_affected(
            &event(
                EventKind::Access(notify::event::AccessKind::Read),
                "/srv/one/main.py",
            ),
            &targets(),
            &mut affected,
        );
        assert!(affected.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_watcher_spawns_nothing() {
        let registry = UpstreamRegistry::new(UpstreamDefaults::default());
        let config = WatcherConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(DevWatcher::spawn(config, registry).unwrap().is_none());
    }
}
