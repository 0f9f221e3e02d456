//! Cross-worker session affinity
//!
//! Streamable HTTP upstream sessions can be pinned to the worker that created
//! them. Ownership lives in the cache under `pool_owner:{mcp_session_id}`,
//! claimed with `SETNX` so contention never produces two owners. Requests
//! landing on other workers consult the pin and forward instead of creating a
//! duplicate upstream session.

use std::sync::Arc;
use std::time::Duration;

use mcpgate_core::cache::{Cache, keys};
use mcpgate_core::GatewayResult;

/// Where a pinned upstream session lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityOwner {
    /// This worker owns the session
    Local,
    /// Another worker owns the session; forward to it
    Remote(String),
}

/// Pins upstream sessions to workers through the cache.
#[derive(Debug, Clone)]
pub struct PoolAffinity {
    cache: Arc<dyn Cache>,
    worker_id: String,
    ttl: Duration,
}

impl PoolAffinity {
    /// Affinity tracker for this worker.
    pub fn new(cache: Arc<dyn Cache>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            worker_id: worker_id.into(),
            ttl,
        }
    }

    /// This worker's id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim or look up the owner of an upstream session.
    ///
    /// Atomic create-if-absent: exactly one worker ever observes `Local`
    /// for a fresh session id.
    pub async fn claim(&self, mcp_session_id: &str) -> GatewayResult<AffinityOwner> {
        let key = keys::pool_owner(mcp_session_id);
        if self
            .cache
            .set_nx(&key, &self.worker_id, Some(self.ttl))
            .await?
        {
            return Ok(AffinityOwner::Local);
        }
        match self.cache.get(&key).await? {
            Some(owner) if owner == self.worker_id => Ok(AffinityOwner::Local),
            Some(owner) => Ok(AffinityOwner::Remote(owner)),
            // Owner expired between SETNX and GET; retry the claim once.
            None => {
                if self
                    .cache
                    .set_nx(&key, &self.worker_id, Some(self.ttl))
                    .await?
                {
                    Ok(AffinityOwner::Local)
                } else {
                    match self.cache.get(&key).await? {
                        Some(owner) if owner == self.worker_id => Ok(AffinityOwner::Local),
                        Some(owner) => Ok(AffinityOwner::Remote(owner)),
                        None => Ok(AffinityOwner::Local),
                    }
                }
            }
        }
    }

    /// Refresh the pin's TTL on activity.
    pub async fn touch(&self, mcp_session_id: &str) -> GatewayResult<()> {
        self.cache
            .expire(&keys::pool_owner(mcp_session_id), self.ttl)
            .await
    }

    /// Drop the pin, best effort, during teardown.
    pub async fn release(&self, mcp_session_id: &str) -> GatewayResult<()> {
        self.cache.del(&keys::pool_owner(mcp_session_id)).await
    }
}
