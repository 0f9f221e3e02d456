//! Cache contract and backends
//!
//! The cache is the single source of truth for cross-worker state: session
//! ownership, pool affinity, forwarded-RPC channels, and the cancellation
//! broadcast all go through it. The contract is the small subset of Redis the
//! core needs — get/set with TTL, atomic `SETNX`, `EXPIRE`, `DEL`, and
//! Pub/Sub. A degraded in-memory shim backs single-worker deployments and
//! tests.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Stable cache key and channel names shared across workers.
pub mod keys {
    /// SSE session owner: `session:{session_id}` → worker id.
    #[must_use]
    pub fn session(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// Upstream session owner: `pool_owner:{mcp_session_id}` → worker id.
    #[must_use]
    pub fn pool_owner(mcp_session_id: &str) -> String {
        format!("pool_owner:{mcp_session_id}")
    }

    /// Per-worker forwarded-RPC inbox channel.
    #[must_use]
    pub fn pool_rpc(worker_id: &str) -> String {
        format!("pool_rpc:{worker_id}")
    }

    /// Per-call forwarded-RPC response channel.
    #[must_use]
    pub fn pool_rpc_response(call_id: &str) -> String {
        format!("pool_rpc_response:{call_id}")
    }

    /// Per-session SSE delivery channel.
    #[must_use]
    pub fn session_channel(session_id: &str) -> String {
        format!("sess:{session_id}")
    }

    /// Advertised HTTP base address of a worker: `worker_addr:{worker_id}`.
    #[must_use]
    pub fn worker_addr(worker_id: &str) -> String {
        format!("worker_addr:{worker_id}")
    }

    /// Cluster cancellation broadcast channel.
    pub const CANCELLATION_CHANNEL: &str = "cancellation:cancel";

    /// Code-execution session registry row.
    #[must_use]
    pub fn code_exec_session(server_id: &str, user_slug: &str, language: &str) -> String {
        format!("code_exec_session:{server_id}:{user_slug}:{language}")
    }
}

/// Messages delivered to a Pub/Sub subscriber.
pub type Subscription = mpsc::Receiver<String>;

/// The cache contract consumed by the core.
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    /// Plain get; `None` when missing or expired.
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    /// Set with optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()>;

    /// Atomic set-if-absent with optional TTL; true when this call created
    /// the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<bool>;

    /// Refresh a key's TTL.
    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()>;

    /// Delete a key.
    async fn del(&self, key: &str) -> GatewayResult<()>;

    /// Fire-and-forget publish.
    async fn publish(&self, channel: &str, payload: &str) -> GatewayResult<()>;

    /// Subscribe to a channel; messages arrive until the receiver is dropped.
    async fn subscribe(&self, channel: &str) -> GatewayResult<Subscription>;
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Redis-backed cache used by multi-worker deployments.
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect and verify the backend is responsive.
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::internal(format!("redis client: {e}")))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatewayError::internal(format!("redis connect: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::internal(format!("redis ping: {e}")))?;
        debug!("redis connection established");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| GatewayError::internal(format!("redis GET {key}: {e}")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs())
                .await
                .map_err(|e| GatewayError::internal(format!("redis SETEX {key}: {e}"))),
            None => conn
                .set(key, value)
                .await
                .map_err(|e| GatewayError::internal(format!("redis SET {key}: {e}"))),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs());
        }
        let created: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::internal(format!("redis SET NX {key}: {e}")))?;
        Ok(created.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(|e| GatewayError::internal(format!("redis EXPIRE {key}: {e}")))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .del(key)
            .await
            .map_err(|e| GatewayError::internal(format!("redis DEL {key}: {e}")))?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| GatewayError::internal(format!("redis PUBLISH {channel}: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> GatewayResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| GatewayError::internal(format!("redis pubsub: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| GatewayError::internal(format!("redis SUBSCRIBE {channel}: {e}")))?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable pubsub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// In-memory shim
// ---------------------------------------------------------------------------

/// In-memory cache for single-worker deployments and tests.
///
/// Honors TTLs lazily on read and mirrors Pub/Sub with broadcast channels.
/// Cross-worker semantics obviously do not hold; `session_affinity_enabled`
/// deployments must use Redis.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

impl MemoryCache {
    /// Create an empty shim.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<bool> {
        // Entry API keeps check-and-insert atomic across tasks.
        let mut created = false;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                }
            });
        if !created && !entry.live() {
            *entry = MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            };
            created = true;
        }
        Ok(created)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> GatewayResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> GatewayResult<()> {
        // No subscribers is not an error, matching Redis.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> GatewayResult<Subscription> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory cache subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_get_set_del_round_trip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_ttl_expires() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_creates_exactly_once() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("owner", "worker-a", None).await.unwrap());
        assert!(!cache.set_nx("owner", "worker-b", None).await.unwrap());
        assert_eq!(cache.get("owner").await.unwrap(), Some("worker-a".into()));
    }

    #[tokio::test]
    async fn set_nx_succeeds_after_expiry() {
        let cache = MemoryCache::new();
        assert!(
            cache
                .set_nx("owner", "a", Some(Duration::from_millis(10)))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.set_nx("owner", "b", None).await.unwrap());
        assert_eq!(cache.get("owner").await.unwrap(), Some("b".into()));
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let cache = MemoryCache::new();
        let mut sub = cache.subscribe("chan").await.unwrap();
        // Subscription task registration races the publish; retry briefly.
        cache.publish("chan", "hello").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(msg, Some("hello".to_string()));
    }

    #[test]
    fn key_formats_are_stable() {
        assert_eq!(keys::session("s1"), "session:s1");
        assert_eq!(keys::pool_owner("m1"), "pool_owner:m1");
        assert_eq!(keys::pool_rpc("w1"), "pool_rpc:w1");
        assert_eq!(keys::pool_rpc_response("u1"), "pool_rpc_response:u1");
        assert_eq!(keys::session_channel("s1"), "sess:s1");
        assert_eq!(keys::worker_addr("w1"), "worker_addr:w1");
        assert_eq!(keys::CANCELLATION_CHANNEL, "cancellation:cancel");
        assert_eq!(
            keys::code_exec_session("srv", "alice", "python"),
            "code_exec_session:srv:alice:python"
        );
    }
}
