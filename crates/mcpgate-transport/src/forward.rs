//! Forwarded RPC between workers
//!
//! When a request lands on a worker that does not own the resource (a
//! Streamable HTTP session pinned elsewhere, an upstream session held by
//! another worker), the request is published on the owner's
//! `pool_rpc:{worker_id}` inbox and the response awaited on a per-call
//! `pool_rpc_response:{uuid}` channel. The owner checks the deadline before
//! executing, so a timed-out caller can never race a late execution into a
//! double run.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use mcpgate_core::cache::{Cache, keys};
use mcpgate_core::{GatewayError, GatewayResult};
use mcpgate_protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};

use crate::handler::{RequestScope, RpcHandler, SessionTransport};
use crate::session::SessionRegistry;

/// Envelope published on a worker's forwarded-RPC inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRpc {
    /// JSON-RPC method
    pub method: String,
    /// JSON-RPC params
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Logical session the call belongs to
    pub session_id: String,
    /// Original request id, echoed in the response
    pub request_id: RequestId,
    /// Channel the owner publishes the single response on
    pub response_channel: String,
    /// Wall-clock deadline; the owner drops expired envelopes
    pub deadline_unix_ms: i64,
}

/// Client side: forward a request to the owning worker and await the
/// response.
#[derive(Debug, Clone)]
pub struct ForwardedRpcClient {
    cache: Arc<dyn Cache>,
    timeout: Duration,
}

impl ForwardedRpcClient {
    /// Client with the configured cross-worker deadline.
    pub fn new(cache: Arc<dyn Cache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    /// Forward `request` to `owner_worker` on behalf of `session_id`.
    pub async fn forward(
        &self,
        owner_worker: &str,
        session_id: &str,
        request: &JsonRpcRequest,
    ) -> GatewayResult<JsonRpcResponse> {
        let call_id = Uuid::new_v4().to_string();
        let response_channel = keys::pool_rpc_response(&call_id);

        // Subscribe before publishing so the response cannot slip past.
        let mut responses = self.cache.subscribe(&response_channel).await?;

        let envelope = ForwardedRpc {
            method: request.method.clone(),
            params: request.params.clone(),
            session_id: session_id.to_string(),
            request_id: request.id.clone(),
            response_channel,
            deadline_unix_ms: chrono::Utc::now().timestamp_millis()
                + self.timeout.as_millis() as i64,
        };
        self.cache
            .publish(
                &keys::pool_rpc(owner_worker),
                &serde_json::to_string(&envelope)?,
            )
            .await?;
        debug!(
            owner = owner_worker,
            session_id,
            method = %request.method,
            "forwarded rpc published"
        );

        let raw = tokio::time::timeout(self.timeout, responses.recv())
            .await
            .map_err(|_| {
                GatewayError::unavailable(format!(
                    "forwarded rpc to '{owner_worker}' timed out"
                ))
            })?
            .ok_or_else(|| GatewayError::unavailable("forwarded rpc channel closed"))?;

        Ok(serde_json::from_str(&raw)?)
    }
}

/// Owner side: drain this worker's inbox and execute on behalf of callers.
///
/// Runs until the returned task is aborted. Each envelope is dispatched on
/// its own task so one slow call cannot head-of-line block the inbox.
pub fn spawn_forward_listener(
    cache: Arc<dyn Cache>,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn RpcHandler>,
) -> tokio::task::JoinHandle<()> {
    let worker_id = registry.worker_id().to_string();
    tokio::spawn(async move {
        let inbox = keys::pool_rpc(&worker_id);
        let mut messages = match cache.subscribe(&inbox).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "forwarded rpc listener failed to subscribe");
                return;
            }
        };
        while let Some(raw) = messages.recv().await {
            let envelope: ForwardedRpc = match serde_json::from_str(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "undecodable forwarded rpc envelope");
                    continue;
                }
            };
            let cache = Arc::clone(&cache);
            let registry = Arc::clone(&registry);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                execute_forwarded(cache, registry, handler, envelope).await;
            });
        }
    })
}

async fn execute_forwarded(
    cache: Arc<dyn Cache>,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn RpcHandler>,
    envelope: ForwardedRpc,
) {
    if chrono::Utc::now().timestamp_millis() > envelope.deadline_unix_ms {
        // The caller has already timed out; executing now risks a double run.
        debug!(
            session_id = %envelope.session_id,
            method = %envelope.method,
            "dropping expired forwarded rpc"
        );
        return;
    }

    let scope = match registry.local(&envelope.session_id) {
        Some(session) => RequestScope {
            session_id: session.session_id.clone(),
            transport: session.transport,
            user: session.user.clone(),
            headers: session.headers.clone(),
        },
        None => RequestScope {
            session_id: envelope.session_id.clone(),
            transport: SessionTransport::StreamableHttp,
            user: mcpgate_core::UserContext::anonymous(),
            headers: http::header::HeaderMap::new(),
        },
    };

    let request = JsonRpcRequest::new(
        envelope.request_id.clone(),
        envelope.method.clone(),
        envelope.params.clone(),
    );
    let response = handler.handle(request, scope).await;

    match serde_json::to_string(&response) {
        Ok(serialized) => {
            if let Err(e) = cache.publish(&envelope.response_channel, &serialized).await {
                warn!(error = %e, "forwarded rpc response publish failed");
            }
        }
        Err(e) => warn!(error = %e, "forwarded rpc response serialization failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcpgate_core::{MemoryCache, UserContext};
    use serde_json::json;

    #[derive(Debug)]
    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, request: JsonRpcRequest, scope: RequestScope) -> JsonRpcResponse {
            JsonRpcResponse::success(
                request.id,
                json!({
                    "method": request.method,
                    "session": scope.session_id,
                    "user": scope.user.user_id,
                }),
            )
        }
    }

    #[tokio::test]
    async fn forward_round_trip_executes_on_owner() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&cache),
            "worker-a",
            Duration::from_secs(300),
        ));
        let mut owner_user = UserContext::anonymous();
        owner_user.user_id = "alice".into();
        registry
            .register(
                "s1",
                SessionTransport::StreamableHttp,
                owner_user,
                http::header::HeaderMap::new(),
                None,
            )
            .await
            .unwrap();

        let _listener =
            spawn_forward_listener(Arc::clone(&cache), Arc::clone(&registry), Arc::new(EchoHandler));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = ForwardedRpcClient::new(Arc::clone(&cache), Duration::from_secs(2));
        let request = JsonRpcRequest::new(7, "tools/call", Some(json!({"name": "echo"})));
        let response = client.forward("worker-a", "s1", &request).await.unwrap();
        let result = response.into_result().unwrap();
        assert_eq!(result["session"], "s1");
        assert_eq!(result["user"], "alice");
    }

    #[tokio::test]
    async fn forward_times_out_as_unavailable() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let client = ForwardedRpcClient::new(Arc::clone(&cache), Duration::from_millis(100));
        let request = JsonRpcRequest::new(1, "ping", None);
        let err = client.forward("nobody", "s1", &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn expired_envelopes_are_dropped() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&cache),
            "worker-a",
            Duration::from_secs(300),
        ));
        let _listener =
            spawn_forward_listener(Arc::clone(&cache), Arc::clone(&registry), Arc::new(EchoHandler));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelope = ForwardedRpc {
            method: "tools/call".into(),
            params: None,
            session_id: "s1".into(),
            request_id: RequestId::Number(1),
            response_channel: keys::pool_rpc_response("expired-call"),
            deadline_unix_ms: chrono::Utc::now().timestamp_millis() - 1_000,
        };
        let mut responses = cache.subscribe(&envelope.response_channel).await.unwrap();
        cache
            .publish(
                &keys::pool_rpc("worker-a"),
                &serde_json::to_string(&envelope).unwrap(),
            )
            .await
            .unwrap();

        let outcome =
            tokio::time::timeout(Duration::from_millis(200), responses.recv()).await;
        assert!(outcome.is_err(), "expired envelope must not be executed");
    }
}
