//! Keyed upstream session pool
//!
//! Sessions are pooled per `(url, identity_hash, transport)`; isolation
//! between identity hashes is non-negotiable. Capacity per key is bounded by
//! a semaphore: a permit is the right to hold one session, taken from the
//! idle list or created fresh. Dropping a handle closes its session;
//! returning it to the pool is an explicit `release`, so every error and
//! cancellation path fails safe.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use http::header::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use mcpgate_core::config::PoolSettings;
use mcpgate_core::dao::TransportKind;
use mcpgate_core::{Authenticator, GatewayError, GatewayResult, identity_hash};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::upstream::{UpstreamConnectConfig, UpstreamSession};

/// Pool key; sessions never cross keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Upstream URL
    pub url: String,
    /// Caller identity digest
    pub identity_hash: String,
    /// Transport the upstream speaks
    pub transport: TransportKind,
}

struct IdleSession {
    session: UpstreamSession,
    idle_since: Instant,
}

struct KeyShared {
    idle: Mutex<VecDeque<IdleSession>>,
    capacity: Arc<Semaphore>,
    waiters: AtomicUsize,
    creations: AtomicU64,
    closes: AtomicU64,
    probe_failures: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl KeyShared {
    fn new(max_per_key: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            capacity: Arc::new(Semaphore::new(max_per_key)),
            waiters: AtomicUsize::new(0),
            creations: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn close_session(&self, session: UpstreamSession) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        session.close();
    }
}

/// Point-in-time metrics for one pool key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMetrics {
    /// Upstream URL
    pub url: String,
    /// Transport name
    pub transport: &'static str,
    /// Idle sessions
    pub idle: usize,
    /// Sessions currently held out
    pub active: usize,
    /// Tasks blocked waiting for capacity
    pub waiters: usize,
    /// Circuit state for the URL
    pub circuit: CircuitState,
    /// Cumulative session creations
    pub creations: u64,
    /// Cumulative session closes
    pub closes: u64,
    /// Cumulative health-probe failures
    pub probe_failures: u64,
}

/// Pool-wide metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Per-key metrics
    pub keys: Vec<KeyMetrics>,
}

/// The upstream session pool.
pub struct UpstreamPool {
    settings: PoolSettings,
    authenticator: Authenticator,
    keys: Mutex<HashMap<PoolKey, Arc<KeyShared>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamPool")
            .field("keys", &self.keys.lock().len())
            .finish_non_exhaustive()
    }
}

impl UpstreamPool {
    /// Create a pool.
    #[must_use]
    pub fn new(settings: PoolSettings, authenticator: Authenticator) -> Self {
        Self {
            settings,
            authenticator,
            keys: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquire a session for the upstream, reusing an idle one when healthy.
    ///
    /// Headers are scrubbed before the identity hash is computed, so spoofed
    /// identity headers can never pollute a pool key. Per-request headers set
    /// here are sticky for the session's life.
    pub async fn acquire(
        self: &Arc<Self>,
        url: &str,
        headers: HeaderMap,
        transport: TransportKind,
    ) -> GatewayResult<PooledHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::unavailable("pool is shut down"));
        }

        let mut headers = headers;
        self.authenticator.scrub_request_headers(&mut headers);
        let key = PoolKey {
            url: url.to_string(),
            identity_hash: identity_hash(&headers),
            transport,
        };

        let breaker = self.breaker_for(url);
        if breaker.state() == CircuitState::Open && !breaker.allow_creation() {
            // Fail fast only while the reset window is still running;
            // allow_creation admits the half-open trial.
            return Err(GatewayError::CircuitOpen {
                url: url.to_string(),
            });
        }

        let shared = self.shared_for(&key);
        shared.touch();

        let permit = self.wait_for_capacity(&shared).await?;

        // Under the permit: idle reuse first, create only when none survive.
        loop {
            let candidate = shared.idle.lock().pop_front();
            let Some(idle) = candidate else { break };

            if idle.idle_since.elapsed() > self.settings.health_check_interval() {
                if idle
                    .session
                    .probe(self.settings.health_check_timeout())
                    .await
                {
                    return Ok(self.handle(idle.session, key, shared, permit));
                }
                shared.probe_failures.fetch_add(1, Ordering::Relaxed);
                warn!(url = %key.url, "idle session failed health probe; discarding");
                shared.close_session(idle.session);
                continue;
            }
            return Ok(self.handle(idle.session, key, shared, permit));
        }

        self.create_session(key, shared, permit, headers, breaker)
            .await
    }

    async fn wait_for_capacity(
        &self,
        shared: &Arc<KeyShared>,
    ) -> GatewayResult<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&shared.capacity);
        shared.waiters.fetch_add(1, Ordering::Relaxed);
        let permit = tokio::time::timeout(
            self.settings.acquire_timeout(),
            semaphore.acquire_owned(),
        )
        .await;
        shared.waiters.fetch_sub(1, Ordering::Relaxed);
        match permit {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(GatewayError::unavailable("pool is shut down")),
            Err(_) => Err(GatewayError::AcquireTimeout {
                timeout_ms: self.settings.acquire_timeout().as_millis() as u64,
            }),
        }
    }

    async fn create_session(
        self: &Arc<Self>,
        key: PoolKey,
        shared: Arc<KeyShared>,
        permit: OwnedSemaphorePermit,
        headers: HeaderMap,
        breaker: Arc<CircuitBreaker>,
    ) -> GatewayResult<PooledHandle> {
        if !breaker.allow_creation() {
            return Err(GatewayError::CircuitOpen { url: key.url });
        }

        let config = UpstreamConnectConfig {
            url: key.url.clone(),
            transport: key.transport,
            headers,
            timeout: self.settings.transport_timeout(),
        };
        let created = tokio::time::timeout(
            self.settings.create_timeout(),
            UpstreamSession::connect(config),
        )
        .await;

        match created {
            Ok(Ok(session)) => {
                breaker.record_success();
                shared.creations.fetch_add(1, Ordering::Relaxed);
                debug!(url = %key.url, identity = %key.identity_hash, "created upstream session");
                Ok(self.handle(session, key, shared, permit))
            }
            Ok(Err(err)) => {
                breaker.record_failure();
                Err(err)
            }
            Err(_) => {
                breaker.record_failure();
                Err(GatewayError::timeout(
                    "pool create",
                    self.settings.create_timeout().as_millis() as u64,
                ))
            }
        }
    }

    fn handle(
        self: &Arc<Self>,
        session: UpstreamSession,
        key: PoolKey,
        shared: Arc<KeyShared>,
        permit: OwnedSemaphorePermit,
    ) -> PooledHandle {
        PooledHandle {
            session: Some(session),
            key,
            shared,
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    fn return_to_idle(&self, shared: &Arc<KeyShared>, session: UpstreamSession) {
        if self.closed.load(Ordering::SeqCst) || session.age() > self.settings.ttl() {
            shared.close_session(session);
            return;
        }
        shared.touch();
        shared.idle.lock().push_back(IdleSession {
            session,
            idle_since: Instant::now(),
        });
    }

    fn shared_for(&self, key: &PoolKey) -> Arc<KeyShared> {
        let mut keys = self.keys.lock();
        Arc::clone(
            keys.entry(key.clone())
                .or_insert_with(|| Arc::new(KeyShared::new(self.settings.max_per_key))),
        )
    }

    fn breaker_for(&self, url: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(url.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                self.settings.circuit_threshold,
                Duration::from_secs(self.settings.circuit_reset_seconds),
            ))
        }))
    }

    /// One maintenance sweep: close over-TTL idle sessions and evict pool
    /// keys idle past `idle_pool_eviction_seconds`.
    pub fn sweep(&self) {
        let eviction_age = Duration::from_secs(self.settings.idle_pool_eviction_seconds);
        let ttl = self.settings.ttl();
        let mut keys = self.keys.lock();
        keys.retain(|key, shared| {
            let mut idle = shared.idle.lock();
            let mut kept = VecDeque::with_capacity(idle.len());
            while let Some(candidate) = idle.pop_front() {
                if candidate.session.age() > ttl {
                    shared.closes.fetch_add(1, Ordering::Relaxed);
                    candidate.session.close();
                } else {
                    kept.push_back(candidate);
                }
            }
            *idle = kept;
            let in_use = self.settings.max_per_key - shared.capacity.available_permits();
            let keep = !idle.is_empty()
                || in_use > 0
                || shared.last_activity.lock().elapsed() < eviction_age;
            if !keep {
                debug!(url = %key.url, "evicting idle pool key");
            }
            keep
        });
    }

    /// Spawn the periodic maintenance task.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.sweep();
            }
        })
    }

    /// Graceful teardown: close every idle session and refuse new acquires.
    /// Held-out handles close on drop.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let keys = std::mem::take(&mut *self.keys.lock());
        for (key, shared) in keys {
            let mut idle = shared.idle.lock();
            let count = idle.len();
            while let Some(candidate) = idle.pop_front() {
                shared.closes.fetch_add(1, Ordering::Relaxed);
                candidate.session.close();
            }
            if count > 0 {
                info!(url = %key.url, closed = count, "closed idle upstream sessions");
            }
        }
    }

    /// Metrics snapshot across every live pool key.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let keys = self.keys.lock();
        let metrics = keys
            .iter()
            .map(|(key, shared)| {
                let idle = shared.idle.lock().len();
                let in_use = self.settings.max_per_key - shared.capacity.available_permits();
                KeyMetrics {
                    url: key.url.clone(),
                    transport: key.transport.as_str(),
                    idle,
                    active: in_use,
                    waiters: shared.waiters.load(Ordering::Relaxed),
                    circuit: self.breaker_for_metrics(&key.url),
                    creations: shared.creations.load(Ordering::Relaxed),
                    closes: shared.closes.load(Ordering::Relaxed),
                    probe_failures: shared.probe_failures.load(Ordering::Relaxed),
                }
            })
            .collect();
        PoolMetrics { keys: metrics }
    }

    fn breaker_for_metrics(&self, url: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(url)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Cumulative (creations, closes) counters for one key, for tests and
    /// the health surface.
    #[must_use]
    pub fn key_counters(&self, key: &PoolKey) -> Option<(u64, u64)> {
        let keys = self.keys.lock();
        keys.get(key).map(|shared| {
            (
                shared.creations.load(Ordering::Relaxed),
                shared.closes.load(Ordering::Relaxed),
            )
        })
    }
}

/// A session held out of the pool.
///
/// Dropping the handle closes the session; call [`PooledHandle::release`] to
/// return it for reuse. Cancellation paths simply drop.
pub struct PooledHandle {
    session: Option<UpstreamSession>,
    key: PoolKey,
    shared: Arc<KeyShared>,
    pool: Arc<UpstreamPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("url", &self.key.url)
            .field("identity", &self.key.identity_hash)
            .finish()
    }
}

impl PooledHandle {
    /// The held session.
    ///
    /// # Panics
    /// Never panics while the handle is alive; the slot is emptied only by
    /// `release` and `Drop`.
    #[must_use]
    pub fn session(&self) -> &UpstreamSession {
        self.session.as_ref().expect("session present until release")
    }

    /// Pool key this handle belongs to.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Return the session to the pool for reuse. Over-TTL sessions are
    /// closed instead.
    pub fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_to_idle(&self.shared, session);
        }
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // Not released: the holder bailed (error or cancellation). An
            // interrupted session must never be reused.
            self.shared.close_session(session);
        }
    }
}
