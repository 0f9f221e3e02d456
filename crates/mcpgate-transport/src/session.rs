//! Logical session registry
//!
//! Maps `session_id → owner worker` through the cache and keeps the local
//! table of sessions this worker owns, with their outbound frame channels.
//! Ownership is claimed with `SETNX`; the TTL is refreshed on activity and
//! backstops leaked sessions after crashes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::HeaderMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mcpgate_core::cache::{Cache, keys};
use mcpgate_core::{GatewayError, GatewayResult, UserContext};

use crate::handler::SessionTransport;

/// A session owned by this worker.
#[derive(Debug)]
pub struct LocalSession {
    /// Session id
    pub session_id: String,
    /// Transport the session runs over
    pub transport: SessionTransport,
    /// Caller identity captured at session creation
    pub user: UserContext,
    /// Headers captured at session creation; sticky for the session
    pub headers: HeaderMap,
    /// Outbound serialized JSON-RPC frames to the client, when the
    /// transport has a server-push path
    pub outbound: Option<mpsc::Sender<String>>,
    /// Creation time
    pub created_at: Instant,
    /// Last observed activity
    pub last_activity: std::sync::Mutex<Instant>,
}

/// Cross-worker session ownership registry.
#[derive(Debug)]
pub struct SessionRegistry {
    cache: Arc<dyn Cache>,
    worker_id: String,
    ttl: Duration,
    local: DashMap<String, Arc<LocalSession>>,
}

impl SessionRegistry {
    /// Registry for this worker.
    pub fn new(cache: Arc<dyn Cache>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            worker_id: worker_id.into(),
            ttl,
            local: DashMap::new(),
        }
    }

    /// This worker's id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Session TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of sessions owned locally.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Claim ownership of a new session and record it locally.
    ///
    /// Fails when another worker already owns the id (`SETNX` lost).
    pub async fn register(
        &self,
        session_id: &str,
        transport: SessionTransport,
        user: UserContext,
        headers: HeaderMap,
        outbound: Option<mpsc::Sender<String>>,
    ) -> GatewayResult<Arc<LocalSession>> {
        let claimed = self
            .cache
            .set_nx(&keys::session(session_id), &self.worker_id, Some(self.ttl))
            .await?;
        if !claimed {
            let owner = self.cache.get(&keys::session(session_id)).await?;
            return Err(GatewayError::invalid_request(format!(
                "session '{session_id}' already owned by '{}'",
                owner.unwrap_or_default()
            )));
        }

        let session = Arc::new(LocalSession {
            session_id: session_id.to_string(),
            transport,
            user,
            headers,
            outbound,
            created_at: Instant::now(),
            last_activity: std::sync::Mutex::new(Instant::now()),
        });
        self.local.insert(session_id.to_string(), Arc::clone(&session));
        debug!(
            session_id,
            transport = transport.as_str(),
            "session registered"
        );
        Ok(session)
    }

    /// Owner worker for a session; `None` when unknown or expired.
    pub async fn lookup(&self, session_id: &str) -> GatewayResult<Option<String>> {
        self.cache.get(&keys::session(session_id)).await
    }

    /// The local record for a session this worker owns.
    #[must_use]
    pub fn local(&self, session_id: &str) -> Option<Arc<LocalSession>> {
        self.local.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Whether this worker owns the session locally.
    #[must_use]
    pub fn owns(&self, session_id: &str) -> bool {
        self.local.contains_key(session_id)
    }

    /// Refresh the ownership TTL and activity timestamp.
    pub async fn touch(&self, session_id: &str) -> GatewayResult<()> {
        if let Some(session) = self.local.get(session_id) {
            *session.last_activity.lock().expect("activity lock") = Instant::now();
        }
        self.cache
            .expire(&keys::session(session_id), self.ttl)
            .await
    }

    /// Deliver a serialized frame to a locally owned session's outbound
    /// channel. Returns false when the session is unknown here or has no
    /// push path.
    pub async fn deliver_local(&self, session_id: &str, frame: String) -> bool {
        let Some(session) = self.local(session_id) else {
            return false;
        };
        let Some(outbound) = &session.outbound else {
            return false;
        };
        if outbound.send(frame).await.is_err() {
            warn!(session_id, "outbound channel closed; dropping frame");
            return false;
        }
        true
    }

    /// Publish a client message toward the session owner's SSE loop.
    ///
    /// Always goes through the cache Pub/Sub, owner-local or not, keeping
    /// the path uniform and observable. The caller must have verified the
    /// owner exists.
    pub async fn publish_to_owner(&self, session_id: &str, message: &str) -> GatewayResult<()> {
        self.cache
            .publish(&keys::session_channel(session_id), message)
            .await
    }

    /// Subscribe to a session's delivery channel; used by the owning
    /// worker's SSE loop.
    pub async fn subscribe_session(
        &self,
        session_id: &str,
    ) -> GatewayResult<mpsc::Receiver<String>> {
        self.cache
            .subscribe(&keys::session_channel(session_id))
            .await
    }

    /// Drop ownership and local state.
    pub async fn unregister(&self, session_id: &str) -> GatewayResult<()> {
        self.local.remove(session_id);
        self.cache.del(&keys::session(session_id)).await?;
        debug!(session_id, "session unregistered");
        Ok(())
    }

    /// Best-effort release of every locally owned session, for shutdown.
    /// TTLs backstop anything missed.
    pub async fn release_all(&self) {
        let ids: Vec<String> = self.local.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.unregister(&id).await {
                warn!(session_id = %id, error = %e, "session release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_core::MemoryCache;

    fn registry(worker: &str, cache: &Arc<dyn Cache>) -> SessionRegistry {
        SessionRegistry::new(Arc::clone(cache), worker, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn register_claims_ownership_once() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = registry("worker-a", &cache);
        let b = registry("worker-b", &cache);

        a.register(
            "s1",
            SessionTransport::Sse,
            UserContext::anonymous(),
            HeaderMap::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(a.lookup("s1").await.unwrap(), Some("worker-a".into()));
        assert_eq!(b.lookup("s1").await.unwrap(), Some("worker-a".into()));
        assert!(a.owns("s1"));
        assert!(!b.owns("s1"));

        let err = b
            .register(
                "s1",
                SessionTransport::Sse,
                UserContext::anonymous(),
                HeaderMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn unregister_clears_cache_and_local_state() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = registry("worker-a", &cache);
        a.register(
            "s1",
            SessionTransport::WebSocket,
            UserContext::anonymous(),
            HeaderMap::new(),
            None,
        )
        .await
        .unwrap();

        a.unregister("s1").await.unwrap();
        assert_eq!(a.lookup("s1").await.unwrap(), None);
        assert!(!a.owns("s1"));
        assert_eq!(a.local_count(), 0);
    }

    #[tokio::test]
    async fn deliver_local_pushes_frames_in_order() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = registry("worker-a", &cache);
        let (tx, mut rx) = mpsc::channel(8);
        a.register(
            "s1",
            SessionTransport::Sse,
            UserContext::anonymous(),
            HeaderMap::new(),
            Some(tx),
        )
        .await
        .unwrap();

        assert!(a.deliver_local("s1", "one".into()).await);
        assert!(a.deliver_local("s1", "two".into()).await);
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");

        assert!(!a.deliver_local("missing", "x".into()).await);
    }

    #[tokio::test]
    async fn sse_messages_route_through_pubsub_even_locally() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = registry("worker-a", &cache);
        let mut sub = a.subscribe_session("s1").await.unwrap();
        a.publish_to_owner("s1", "{\"method\":\"ping\"}").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(got.unwrap(), "{\"method\":\"ping\"}");
    }
}
