//! Cluster-wide cancellation of in-flight runs
//!
//! Cancellation is gateway-authoritative: each worker keeps a local registry
//! of its in-flight runs, and cancel requests that miss locally are broadcast
//! on the `cancellation:cancel` Pub/Sub channel for the owning worker to pick
//! up. The dispatcher awaits each run's token alongside the upstream call, so
//! cancellation interrupts I/O at the next yield point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mcpgate_core::cache::{Cache, keys};
use mcpgate_core::dao::{AuditRecord, Dao};
use mcpgate_core::{GatewayError, GatewayResult};
use mcpgate_protocol::{JsonRpcNotification, methods};
use mcpgate_transport::SessionRegistry;

/// How long cancelled run records stay queryable after the run ends.
const CANCELLED_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct RunRecord {
    name: String,
    session_id: Option<String>,
    registered_at: DateTime<Utc>,
    token: CancellationToken,
    cancelled: bool,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    completed: bool,
}

/// Queryable status of a run on this worker.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    /// Tool/resource/prompt name
    pub name: String,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Whether the run was cancelled
    pub cancelled: bool,
    /// When it was cancelled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Why it was cancelled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    /// `cancelled` when tripped locally, `queued` when broadcast
    pub status: String,
    /// The targeted run
    pub request_id: String,
    /// Reason, echoed back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Wire shape of a broadcast cancel message.
#[derive(Debug, Serialize, Deserialize)]
struct CancelMessage {
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Local run registry plus the cluster cancel channel.
#[derive(Debug)]
pub struct CancellationService {
    cache: Arc<dyn Cache>,
    registry: Arc<SessionRegistry>,
    dao: Arc<dyn Dao>,
    runs: DashMap<String, RunRecord>,
}

impl CancellationService {
    /// Service for this worker.
    pub fn new(
        cache: Arc<dyn Cache>,
        registry: Arc<SessionRegistry>,
        dao: Arc<dyn Dao>,
    ) -> Self {
        Self {
            cache,
            registry,
            dao,
            runs: DashMap::new(),
        }
    }

    /// Track a new in-flight run; the dispatcher awaits the returned token
    /// alongside the upstream call.
    pub fn register_run(
        &self,
        request_id: &str,
        name: &str,
        session_id: Option<&str>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        self.runs.insert(
            request_id.to_string(),
            RunRecord {
                name: name.to_string(),
                session_id: session_id.map(str::to_string),
                registered_at: Utc::now(),
                token: token.clone(),
                cancelled: false,
                cancelled_at: None,
                cancel_reason: None,
                completed: false,
            },
        );
        debug!(request_id, name, "run registered");
        token
    }

    /// The run finished (any outcome). Cancelled records stay queryable for
    /// a retention window; others are dropped immediately.
    pub fn deregister_run(&self, request_id: &str) {
        let mut drop_it = true;
        if let Some(mut record) = self.runs.get_mut(request_id) {
            if record.cancelled {
                record.completed = true;
                drop_it = false;
            }
        }
        if drop_it {
            self.runs.remove(request_id);
        }
        debug!(request_id, "run deregistered");
    }

    /// Number of live runs on this worker.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.runs.iter().filter(|r| !r.completed).count()
    }

    /// Cancel a run, locally if this worker owns it, otherwise by cluster
    /// broadcast.
    pub async fn cancel_run(
        &self,
        request_id: &str,
        reason: Option<String>,
    ) -> GatewayResult<CancelOutcome> {
        if self.cancel_local(request_id, reason.as_deref()).await {
            return Ok(CancelOutcome {
                status: "cancelled".to_string(),
                request_id: request_id.to_string(),
                reason,
            });
        }

        let message = CancelMessage {
            request_id: request_id.to_string(),
            reason: reason.clone(),
        };
        self.cache
            .publish(
                keys::CANCELLATION_CHANNEL,
                &serde_json::to_string(&message)?,
            )
            .await?;
        info!(request_id, "cancel queued on cluster channel");
        Ok(CancelOutcome {
            status: "queued".to_string(),
            request_id: request_id.to_string(),
            reason,
        })
    }

    /// Cancel every in-flight run belonging to a session; used when its
    /// client disconnects.
    pub async fn cancel_session_runs(&self, session_id: &str, reason: &str) {
        let targets: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| {
                entry.session_id.as_deref() == Some(session_id) && !entry.cancelled
            })
            .map(|entry| entry.key().clone())
            .collect();
        for request_id in targets {
            self.cancel_local(&request_id, Some(reason)).await;
        }
    }

    /// Status of a run on this worker; `None` when unknown here.
    #[must_use]
    pub fn status(&self, request_id: &str) -> Option<RunStatus> {
        self.runs.get(request_id).map(|record| RunStatus {
            name: record.name.clone(),
            registered_at: record.registered_at,
            cancelled: record.cancelled,
            cancelled_at: record.cancelled_at,
            cancel_reason: record.cancel_reason.clone(),
        })
    }

    async fn cancel_local(&self, request_id: &str, reason: Option<&str>) -> bool {
        let (session_id, name) = {
            let Some(mut record) = self.runs.get_mut(request_id) else {
                return false;
            };
            if record.completed {
                return false;
            }
            record.cancelled = true;
            record.cancelled_at = Some(Utc::now());
            record.cancel_reason = reason.map(str::to_string);
            record.token.cancel();
            (record.session_id.clone(), record.name.clone())
        };
        info!(request_id, reason = reason.unwrap_or("unspecified"), "run cancelled");

        // Cancellations are audited like passthrough calls. The principal is
        // not known at this layer (the trip may come off the cluster
        // channel), so the record carries the gateway itself as the actor.
        let audit = AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            auth_method: "internal".to_string(),
            acting_as: None,
            delegation_chain: Vec::new(),
            operation: format!("cancellation:cancel:{request_id}"),
            outcome: "cancelled".to_string(),
            detail: json!({
                "name": name,
                "session_id": session_id,
                "reason": reason.unwrap_or("unspecified"),
            }),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.dao.record_audit(audit).await {
            warn!(request_id, error = %e, "cancellation audit write failed");
        }

        // Tell the client over its own transport.
        if let Some(session_id) = session_id {
            let note = JsonRpcNotification::new(
                methods::NOTIFICATIONS_CANCELLED,
                Some(json!({
                    "requestId": request_id,
                    "reason": reason.unwrap_or("cancelled"),
                })),
            );
            if let Ok(frame) = serde_json::to_string(&note)
                && !self.registry.deliver_local(&session_id, frame).await
            {
                debug!(request_id, session_id = %session_id, "no push path for cancel notice");
            }
        }
        true
    }

    /// Subscribe to the cluster cancel channel and run the retention sweep.
    pub fn spawn_cancel_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut messages = match service.cache.subscribe(keys::CANCELLATION_CHANNEL).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(error = %e, "cancel listener failed to subscribe");
                    return;
                }
            };
            let mut sweep = tokio::time::interval(Duration::from_secs(60));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    message = messages.recv() => {
                        let Some(raw) = message else { break };
                        match serde_json::from_str::<CancelMessage>(&raw) {
                            Ok(message) => {
                                service
                                    .cancel_local(&message.request_id, message.reason.as_deref())
                                    .await;
                            }
                            Err(e) => warn!(error = %e, "undecodable cancel message"),
                        }
                    }
                    _ = sweep.tick() => {
                        service.purge_retained();
                    }
                }
            }
        })
    }

    fn purge_retained(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(CANCELLED_RETENTION).expect("retention fits");
        self.runs.retain(|_, record| {
            !(record.completed
                && record.cancelled_at.is_some_and(|at| at < cutoff))
        });
    }
}

/// Map a cancelled token into the error every caller reports.
pub fn cancelled_error(reason: Option<&str>) -> GatewayError {
    GatewayError::cancelled(reason.unwrap_or("cancelled").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderMap;
    use mcpgate_core::{MemoryCache, MemoryDao, UserContext};
    use mcpgate_transport::SessionTransport;

    struct Fixture {
        service: Arc<CancellationService>,
        dao: Arc<MemoryDao>,
        frames: tokio::sync::mpsc::Receiver<String>,
    }

    async fn service_with_session() -> Fixture {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&cache),
            "worker-a",
            Duration::from_secs(300),
        ));
        let (tx, frames) = tokio::sync::mpsc::channel(8);
        registry
            .register(
                "s1",
                SessionTransport::WebSocket,
                UserContext::anonymous(),
                HeaderMap::new(),
                Some(tx),
            )
            .await
            .unwrap();
        let dao = Arc::new(MemoryDao::new());
        Fixture {
            service: Arc::new(CancellationService::new(cache, registry, Arc::clone(&dao) as _)),
            dao,
            frames,
        }
    }

    #[tokio::test]
    async fn register_then_deregister_leaves_registry_empty() {
        let Fixture { service, .. } = service_with_session().await;
        service.register_run("r1", "echo", Some("s1"));
        assert!(service.status("r1").is_some());
        service.deregister_run("r1");
        assert!(service.status("r1").is_none());
        assert_eq!(service.active_runs(), 0);
    }

    #[tokio::test]
    async fn local_cancel_trips_token_and_notifies_client() {
        let Fixture {
            service,
            dao,
            frames: mut rx,
        } = service_with_session().await;
        let token = service.register_run("r1", "slow-tool", Some("s1"));
        assert!(!token.is_cancelled());

        let outcome = service
            .cancel_run("r1", Some("operator request".into()))
            .await
            .unwrap();
        assert_eq!(outcome.status, "cancelled");
        assert_eq!(outcome.request_id, "r1");
        assert!(token.is_cancelled());

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let note: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(note["method"], "notifications/cancelled");
        assert_eq!(note["params"]["requestId"], "r1");
        assert_eq!(note["params"]["reason"], "operator request");

        let status = service.status("r1").unwrap();
        assert!(status.cancelled);
        assert_eq!(status.cancel_reason.as_deref(), Some("operator request"));

        let audit = dao.audit_log();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].operation, "cancellation:cancel:r1");
        assert_eq!(audit[0].outcome, "cancelled");
        assert_eq!(audit[0].detail["reason"], "operator request");
        assert_eq!(audit[0].detail["name"], "slow-tool");
    }

    #[tokio::test]
    async fn unknown_run_queues_on_the_cluster_channel() {
        let Fixture { service, dao, .. } = service_with_session().await;
        let mut sub = service
            .cache
            .subscribe(keys::CANCELLATION_CHANNEL)
            .await
            .unwrap();

        let outcome = service.cancel_run("elsewhere", None).await.unwrap();
        assert_eq!(outcome.status, "queued");

        let raw = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let message: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(message["request_id"], "elsewhere");
        // Nothing was cancelled here, so nothing was audited here.
        assert!(dao.audit_log().is_empty());
    }

    #[tokio::test]
    async fn broadcast_cancel_reaches_the_owning_worker() {
        let Fixture { service, dao, .. } = service_with_session().await;
        let token = service.register_run("r9", "echo", Some("s1"));
        let _listener = service.spawn_cancel_listener();
        tokio::time::sleep(Duration::from_millis(20)).await;

        service
            .cache
            .publish(
                keys::CANCELLATION_CHANNEL,
                r#"{"request_id":"r9","reason":"remote"}"#,
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(service.status("r9").unwrap().cancelled);
        // Broadcast-triggered cancellations are audited on the owner.
        assert_eq!(dao.audit_log().len(), 1);
        assert_eq!(dao.audit_log()[0].operation, "cancellation:cancel:r9");
    }

    #[tokio::test]
    async fn disconnect_cancels_only_that_sessions_runs() {
        let Fixture { service, .. } = service_with_session().await;
        let t1 = service.register_run("r1", "a", Some("s1"));
        let t2 = service.register_run("r2", "b", Some("s2"));

        service.cancel_session_runs("s1", "client disconnect").await;
        assert!(t1.is_cancelled());
        assert!(!t2.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_run_stays_queryable_after_completion() {
        let Fixture { service, .. } = service_with_session().await;
        service.register_run("r1", "echo", Some("s1"));
        service.cancel_run("r1", None).await.unwrap();
        service.deregister_run("r1");
        // Still queryable within the retention window.
        assert!(service.status("r1").unwrap().cancelled);
    }
}
