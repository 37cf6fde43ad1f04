//! Audit sink: best-effort traffic recording

use std::sync::Arc;
use tracing::warn;

use manifold_storage::{NewTrafficLog, TrafficLogRepository};

/// The single writer of traffic rows
///
/// Writes happen off the request path; a failed insert is logged and never
/// surfaces to the client.
pub struct AuditSink {
    repo: Arc<dyn TrafficLogRepository>,
}

impl AuditSink {
    pub fn new(repo: Arc<dyn TrafficLogRepository>) -> Arc<Self> {
        Arc::new(Self { repo })
    }

    /// Queue one traffic row
    pub fn record(&self, record: NewTrafficLog) {
        let repo = Arc::clone(&self.repo);
        tokio::spawn(async move {
            if let Err(e) = repo.insert(record).await {
                warn!(error = %e, "failed to write traffic record");
            }
        });
    }
}
