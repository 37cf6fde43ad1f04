//! Session store: allocation, stream bookkeeping and idle expiry

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use manifold_config::GatewayConfig;
use manifold_protocol::{ClientCapabilities, GatewayError, GatewayResult};

/// Bounded frame queue feeding one background push stream
///
/// Overflow drops the oldest undelivered frame; the stream itself stays up.
pub struct PushQueue {
    frames: Mutex<VecDeque<Value>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl PushQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        })
    }

    /// Queue a frame for delivery; returns false once the stream is gone
    pub async fn push(&self, frame: Value) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut frames = self.frames.lock().await;
            if frames.len() >= self.capacity {
                frames.pop_front();
                warn!("push stream consumer is slow, dropping oldest frame");
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame; `None` once closed and drained
    pub async fn pop(&self) -> Option<Value> {
        loop {
            {
                let mut frames = self.frames.lock().await;
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue and wake any waiting reader
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One client conversation bound to one upstream endpoint
pub struct Session {
    pub id: String,
    pub upstream_id: String,
    pub api_key_id: Option<String>,
    pub capabilities: ClientCapabilities,
    pub created_at: DateTime<Utc>,

    last_activity_at: RwLock<DateTime<Utc>>,
    /// The single optional background push stream
    push: Mutex<Option<Arc<PushQueue>>>,
}

impl Session {
    fn new(
        upstream_id: String,
        api_key_id: Option<String>,
        capabilities: ClientCapabilities,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            upstream_id,
            api_key_id,
            capabilities,
            created_at: now,
            last_activity_at: RwLock::new(now),
            push: Mutex::new(None),
        })
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity_at.read().await
    }

    pub async fn touch(&self) {
        *self.last_activity_at.write().await = Utc::now();
    }

    /// Bind a new background stream, evicting the previous one
    pub async fn attach_push(&self, queue: Arc<PushQueue>) {
        let mut push = self.push.lock().await;
        if let Some(old) = push.replace(queue) {
            old.close();
        }
    }

    /// Unbind the given stream if it is still the active one
    pub async fn detach_push(&self, queue: &Arc<PushQueue>) {
        let mut push = self.push.lock().await;
        if let Some(current) = push.as_ref() {
            if Arc::ptr_eq(current, queue) {
                push.take();
            }
        }
        queue.close();
    }

    /// The current background stream queue, if one is attached
    pub async fn push_queue(&self) -> Option<Arc<PushQueue>> {
        self.push.lock().await.clone()
    }

    /// Close every stream bound to this session
    async fn close_streams(&self) {
        if let Some(queue) = self.push.lock().await.take() {
            queue.close();
        }
    }
}

/// Owns every session; allocation, lookup, idle expiry
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
    cleanup_interval: Duration,
    max_sessions: usize,
    push_queue_depth: usize,
}

impl SessionStore {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout: config.session_idle_timeout,
            cleanup_interval: config.session_cleanup_interval,
            max_sessions: config.max_sessions,
            push_queue_depth: config.push_queue_depth,
        })
    }

    /// Frames buffered per background stream
    pub fn push_queue_depth(&self) -> usize {
        self.push_queue_depth
    }

    /// Allocate a fresh session
    pub async fn create(
        &self,
        upstream_id: &str,
        api_key_id: Option<String>,
        capabilities: ClientCapabilities,
    ) -> GatewayResult<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(GatewayError::MaxSessions);
        }
        let session = Session::new(upstream_id.to_string(), api_key_id, capabilities);
        sessions.insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, upstream_id = %upstream_id, "session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Look up a session and enforce its upstream binding
    pub async fn get_for_upstream(
        &self,
        session_id: &str,
        upstream_id: &str,
    ) -> GatewayResult<Arc<Session>> {
        match self.get(session_id).await {
            Some(session) if session.upstream_id == upstream_id => Ok(session),
            // A session bound elsewhere is as unusable here as a missing one
            _ => Err(GatewayError::SessionNotFound),
        }
    }

    /// Remove a session, closing its streams
    pub async fn delete(&self, session_id: &str) -> bool {
        let session = self.sessions.write().await.remove(session_id);
        match session {
            Some(session) => {
                session.close_streams().await;
                info!(session_id = %session_id, "session deleted");
                true
            }
            None => false,
        }
    }

    /// Every session owned by one upstream
    pub async fn for_upstream(&self, upstream_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.upstream_id == upstream_id)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One expiry sweep; returns the number of removed sessions
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let idle_timeout =
            chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::hours(1));

        let expired: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for session in sessions.values() {
                if session.last_activity_at().await + idle_timeout < now {
                    expired.push(Arc::clone(session));
                }
            }
            expired
        };

        let mut removed = 0;
        for session in expired {
            session.close_streams().await;
            if self.sessions.write().await.remove(&session.id).is_some() {
                debug!(session_id = %session.id, "expired idle session");
                removed += 1;
            }
        }
        removed
    }

    /// Background cleanup tick
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.cleanup_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = store.sweep().await;
                if removed > 0 {
                    info!(removed, "session cleanup removed idle sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store(idle: Duration) -> Arc<SessionStore> {
        let config = GatewayConfig {
            session_idle_timeout: idle,
            session_cleanup_interval: Duration::from_secs(600),
            max_sessions: 4,
            ..Default::default()
        };
        SessionStore::new(&config)
    }

    #[tokio::test]
    async fn test_session_id_format() {
        let store = test_store(Duration::from_secs(3600));
        let session = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();

        // Printable ASCII, long enough to carry 16 bytes of entropy
        assert!(session.id.len() >= 16);
        assert!(session.id.bytes().all(|b| (0x21..=0x7e).contains(&b)));
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let store = test_store(Duration::from_secs(3600));
        let a = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();
        let b = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_upstream_binding_is_enforced() {
        let store = test_store(Duration::from_secs(3600));
        let session = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();

        assert!(store.get_for_upstream(&session.id, "u1").await.is_ok());
        assert!(matches!(
            store.get_for_upstream(&session.id, "u2").await,
            Err(GatewayError::SessionNotFound)
        ));
        assert!(matches!(
            store.get_for_upstream("nope", "u1").await,
            Err(GatewayError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let store = test_store(Duration::from_secs(3600));
        for _ in 0..4 {
            store
                .create("u1", None, ClientCapabilities::default())
                .await
                .unwrap();
        }
        assert!(matches!(
            store.create("u1", None, ClientCapabilities::default()).await,
            Err(GatewayError::MaxSessions)
        ));
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_sessions_and_closes_streams() {
        let store = test_store(Duration::from_millis(10));
        let session = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();
        let queue = PushQueue::new(8);
        session.attach_push(Arc::clone(&queue)).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let removed = store.sweep().await;

        assert_eq!(removed, 1);
        assert_eq!(store.count().await, 0);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_active_session_survives_sweep() {
        let store = test_store(Duration::from_secs(3600));
        let session = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();
        session.touch().await;

        assert_eq!(store.sweep().await, 0);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_push_queue_delivers_in_order() {
        let queue = PushQueue::new(8);
        assert!(queue.push(json!({"n": 1})).await);
        assert!(queue.push(json!({"n": 2})).await);

        assert_eq!(queue.pop().await.unwrap()["n"], 1);
        assert_eq!(queue.pop().await.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_push_queue_drops_oldest_on_overflow() {
        let queue = PushQueue::new(2);
        queue.push(json!({"n": 1})).await;
        queue.push(json!({"n": 2})).await;
        queue.push(json!({"n": 3})).await;

        assert_eq!(queue.pop().await.unwrap()["n"], 2);
        assert_eq!(queue.pop().await.unwrap()["n"], 3);
    }

    #[tokio::test]
    async fn test_push_queue_close_unblocks_reader() {
        let queue = PushQueue::new(2);
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(reader.await.unwrap(), None);
        assert!(!queue.push(json!({})).await);
    }

    #[tokio::test]
    async fn test_attach_push_evicts_previous_stream() {
        let store = test_store(Duration::from_secs(3600));
        let session = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();

        let first = PushQueue::new(8);
        let second = PushQueue::new(8);
        session.attach_push(Arc::clone(&first)).await;
        session.attach_push(Arc::clone(&second)).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&session.push_queue().await.unwrap(), &second));
    }

    #[tokio::test]
    async fn test_detach_only_removes_own_stream() {
        let store = test_store(Duration::from_secs(3600));
        let session = store
            .create("u1", None, ClientCapabilities::default())
            .await
            .unwrap();

        let first = PushQueue::new(8);
        let second = PushQueue::new(8);
        session.attach_push(Arc::clone(&first)).await;
        session.attach_push(Arc::clone(&second)).await;

        // The evicted stream's request task exits late; it must not tear
        // down the replacement
        session.detach_push(&first).await;
        assert!(session.push_queue().await.is_some());

        session.detach_push(&second).await;
        assert!(session.push_queue().await.is_none());
    }
}
