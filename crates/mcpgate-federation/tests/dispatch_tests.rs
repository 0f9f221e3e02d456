//! Dispatcher behavior with a full component stack and a mock upstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpgate_core::config::{PassthroughSettings, PoolSettings};
use mcpgate_core::dao::{
    GatewayRecord, Integration, ToolRecord, TransportKind, UpstreamAuth, Visibility,
};
use mcpgate_core::identity::AuthConfig;
use mcpgate_core::{
    Authenticator, Dao, GatewayError, GatewayResult, IdentityPropagation, MemoryCache,
    MemoryDao, UserContext,
};
use mcpgate_federation::{CancellationService, Dispatcher, Passthrough};
use mcpgate_plugins::{
    Hook, HookPayload, Plugin, PluginContext, PluginMode, PluginOutcome, PluginPipeline,
    Violation,
};
use mcpgate_pool::{PoolAffinity, UpstreamPool};
use mcpgate_transport::{RequestScope, SessionRegistry, SessionTransport};

/// Counts post-hook executions so tests can assert they were skipped.
#[derive(Debug, Default)]
struct PostHookCounter {
    runs: AtomicUsize,
}

#[async_trait]
impl Plugin for PostHookCounter {
    fn name(&self) -> &str {
        "post-counter"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::ToolPostInvoke]
    }

    async fn on_hook(
        &self,
        _hook: Hook,
        payload: HookPayload,
        _ctx: &PluginContext,
    ) -> GatewayResult<PluginOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(PluginOutcome::Continue(payload))
    }
}

/// Rejects every pre-invoke.
#[derive(Debug)]
struct AlwaysBlock;

#[async_trait]
impl Plugin for AlwaysBlock {
    fn name(&self) -> &str {
        "always-block"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::ToolPreInvoke]
    }

    async fn on_hook(
        &self,
        _hook: Hook,
        _payload: HookPayload,
        _ctx: &PluginContext,
    ) -> GatewayResult<PluginOutcome> {
        Ok(PluginOutcome::Violation(Violation::error("blocked")))
    }
}

struct Stack {
    dispatcher: Dispatcher,
    cancellations: Arc<CancellationService>,
    post_counter: Arc<PostHookCounter>,
}

async fn stack(upstream_url: &str, block_pre: bool) -> Stack {
    let cache = Arc::new(MemoryCache::new());
    let dao = Arc::new(MemoryDao::new());
    dao.upsert_gateway(GatewayRecord {
        id: "g1".into(),
        url: upstream_url.to_string(),
        transport: TransportKind::StreamableHttp,
        auth: UpstreamAuth::None,
        identity_propagation: None,
        team_id: None,
        visibility: Visibility::Public,
        enabled: true,
        reachable: true,
        last_seen: None,
    })
    .await
    .unwrap();
    dao.upsert_tool(ToolRecord {
        id: "t1".into(),
        gateway_id: Some("g1".into()),
        team_id: None,
        owner_id: None,
        name: "slow-echo".into(),
        integration: Integration::Mcp {
            remote_name: "slow-echo".into(),
        },
        schema: Value::Null,
        tags: Vec::new(),
        visibility: Visibility::Public,
        enabled: true,
        plugin_pre_chain: Vec::new(),
        plugin_post_chain: Vec::new(),
    })
    .await
    .unwrap();

    let authenticator = Authenticator::new(AuthConfig {
        anonymous_enabled: true,
        ..AuthConfig::default()
    });
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&cache) as _,
        "worker-test",
        Duration::from_secs(300),
    ));
    let cancellations = Arc::new(CancellationService::new(
        Arc::clone(&cache) as _,
        Arc::clone(&registry),
        Arc::clone(&dao) as Arc<dyn Dao>,
    ));
    let pool = Arc::new(UpstreamPool::new(
        PoolSettings {
            acquire_timeout_seconds: 5,
            transport_timeout_seconds: 10,
            create_timeout_seconds: 5,
            ..PoolSettings::default()
        },
        authenticator.clone(),
    ));

    let post_counter = Arc::new(PostHookCounter::default());
    let mut pipeline = PluginPipeline::new();
    if block_pre {
        pipeline.register(Arc::new(AlwaysBlock), PluginMode::Enforce);
    }
    pipeline.register(Arc::clone(&post_counter) as Arc<dyn Plugin>, PluginMode::Enforce);
    let pipeline = Arc::new(pipeline);

    let passthrough = Arc::new(
        Passthrough::new(
            PassthroughSettings::default(),
            Arc::clone(&dao) as Arc<dyn Dao>,
            Arc::clone(&pipeline),
            authenticator.clone(),
        )
        .unwrap(),
    );

    let dispatcher = Dispatcher::new(
        Arc::clone(&dao) as Arc<dyn Dao>,
        pipeline,
        pool,
        PoolAffinity::new(Arc::clone(&cache) as _, "worker-test", Duration::from_secs(300)),
        Arc::clone(&cancellations),
        authenticator,
        IdentityPropagation::default(),
        PoolSettings::default(),
        PassthroughSettings::default(),
        passthrough,
        None,
    )
    .unwrap();

    Stack {
        dispatcher,
        cancellations,
        post_counter,
    }
}

fn scope() -> RequestScope {
    RequestScope {
        session_id: "s-test".into(),
        transport: SessionTransport::StreamableHttp,
        user: UserContext::anonymous(),
        headers: http::header::HeaderMap::new(),
    }
}

async fn mock_upstream(call_delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": {"capabilities": {}},
            "id": 1,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(call_delay)
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "result": {"content": [{"type": "text", "text": "done"}], "isError": false},
                    "id": 2,
                })),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn cancellation_beats_the_upstream_and_skips_post_hooks() {
    let upstream = mock_upstream(Duration::from_secs(5)).await;
    let stack = Arc::new(stack(&format!("{}/mcp", upstream.uri()), false).await);

    let invoker = Arc::clone(&stack);
    let run = tokio::spawn(async move {
        invoker
            .dispatcher
            .invoke_tool("slow-echo", json!({}), &scope(), "R1")
            .await
    });

    // Give the run time to reach the upstream, then cancel.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let outcome = stack.cancellations.cancel_run("R1", Some("test".into())).await.unwrap();
    assert_eq!(outcome.status, "cancelled");

    let result = run.await.unwrap();
    assert!(matches!(result, Err(GatewayError::Cancelled { .. })));
    // No post-hook ran for the cancelled run.
    assert_eq!(stack.post_counter.runs.load(Ordering::SeqCst), 0);
    // The status survives completion.
    assert!(stack.cancellations.status("R1").unwrap().cancelled);
}

#[tokio::test]
async fn successful_run_passes_post_hooks_and_clears_the_registry() {
    let upstream = mock_upstream(Duration::from_millis(10)).await;
    let stack = stack(&format!("{}/mcp", upstream.uri()), false).await;

    let result = stack
        .dispatcher
        .invoke_tool("slow-echo", json!({}), &scope(), "R2")
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "done");
    assert_eq!(stack.post_counter.runs.load(Ordering::SeqCst), 1);
    assert!(stack.cancellations.status("R2").is_none());
}

#[tokio::test]
async fn enforce_violation_blocks_before_any_upstream_call() {
    let upstream = mock_upstream(Duration::from_millis(10)).await;
    let stack = stack(&format!("{}/mcp", upstream.uri()), true).await;

    let err = stack
        .dispatcher
        .invoke_tool("slow-echo", json!({}), &scope(), "R3")
        .await
        .unwrap_err();
    match err {
        GatewayError::PolicyViolation { plugin, .. } => assert_eq!(plugin, "always-block"),
        other => panic!("expected PolicyViolation, got {other:?}"),
    }
    // The upstream never saw a tools/call.
    let calls = upstream.received_requests().await.unwrap();
    assert!(
        calls
            .iter()
            .all(|r| !String::from_utf8_lossy(&r.body).contains("tools/call"))
    );

    let err = stack
        .dispatcher
        .invoke_tool("missing-tool", json!({}), &scope(), "R4")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }));
}
