//! # mcpgate-pool
//!
//! Reusable MCP sessions to upstream servers, pooled per
//! `(url, identity_hash, transport)` with health probing, TTL enforcement,
//! a per-URL circuit breaker on session creation, and cross-worker affinity
//! pinning.

pub mod affinity;
pub mod breaker;
pub mod pool;
pub mod upstream;

pub use affinity::{AffinityOwner, PoolAffinity};
pub use breaker::{CircuitBreaker, CircuitState};
pub use pool::{KeyMetrics, PoolKey, PoolMetrics, PooledHandle, UpstreamPool};
pub use upstream::{UpstreamConnectConfig, UpstreamSession};
