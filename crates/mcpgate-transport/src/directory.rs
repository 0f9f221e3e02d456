//! Worker address directory
//!
//! Each worker advertises its HTTP base address in the cache under
//! `worker_addr:{worker_id}`, refreshed on a fraction of the TTL so crashed
//! workers age out. The `/rpc` forwarding path looks peers up here to reach
//! the owning worker over HTTP.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use mcpgate_core::cache::{Cache, keys};
use mcpgate_core::GatewayResult;

/// Cache-backed directory of worker HTTP addresses.
#[derive(Debug, Clone)]
pub struct WorkerDirectory {
    cache: Arc<dyn Cache>,
    worker_id: String,
    addr: String,
    ttl: Duration,
}

impl WorkerDirectory {
    /// Directory entry for this worker.
    pub fn new(
        cache: Arc<dyn Cache>,
        worker_id: impl Into<String>,
        addr: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            worker_id: worker_id.into(),
            addr: addr.into(),
            ttl,
        }
    }

    /// This worker's advertised address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write this worker's address with the directory TTL.
    pub async fn advertise(&self) -> GatewayResult<()> {
        self.cache
            .set(
                &keys::worker_addr(&self.worker_id),
                &self.addr,
                Some(self.ttl),
            )
            .await
    }

    /// Resolve a peer's advertised address; `None` when unknown or aged out.
    pub async fn lookup(&self, worker_id: &str) -> GatewayResult<Option<String>> {
        self.cache.get(&keys::worker_addr(worker_id)).await
    }

    /// Drop this worker's advertisement, for shutdown.
    pub async fn withdraw(&self) -> GatewayResult<()> {
        self.cache.del(&keys::worker_addr(&self.worker_id)).await
    }

    /// Advertise now and keep the entry refreshed until the task is aborted.
    pub fn spawn_advertiser(&self) -> tokio::task::JoinHandle<()> {
        let directory = self.clone();
        tokio::spawn(async move {
            let refresh = directory.ttl / 3;
            let mut tick = tokio::time::interval(refresh.max(Duration::from_secs(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match directory.advertise().await {
                    Ok(()) => debug!(worker_id = %directory.worker_id, "worker address advertised"),
                    Err(e) => warn!(error = %e, "worker address advertisement failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_core::MemoryCache;

    #[tokio::test]
    async fn advertise_lookup_withdraw_round_trip() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = WorkerDirectory::new(
            Arc::clone(&cache),
            "worker-a",
            "http://10.0.0.1:4444",
            Duration::from_secs(300),
        );
        let b = WorkerDirectory::new(
            Arc::clone(&cache),
            "worker-b",
            "http://10.0.0.2:4444",
            Duration::from_secs(300),
        );

        a.advertise().await.unwrap();
        assert_eq!(
            b.lookup("worker-a").await.unwrap(),
            Some("http://10.0.0.1:4444".to_string())
        );
        assert_eq!(b.lookup("worker-c").await.unwrap(), None);

        a.withdraw().await.unwrap();
        assert_eq!(b.lookup("worker-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn advertisements_expire_with_the_ttl() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = WorkerDirectory::new(
            Arc::clone(&cache),
            "worker-a",
            "http://10.0.0.1:4444",
            Duration::from_millis(20),
        );
        a.advertise().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.lookup("worker-a").await.unwrap(), None);
    }
}
