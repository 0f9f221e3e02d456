//! Cross-worker behavior: two in-process gateways sharing one cache.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpgate_core::cache::Cache;
use mcpgate_core::dao::{
    GatewayRecord, Integration, ToolRecord, TransportKind, UpstreamAuth, Visibility,
};
use mcpgate_core::{Dao, GatewayConfig, MemoryCache, MemoryDao};
use mcpgate_server::{AppContext, router};

async fn mock_mcp_upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": {"protocolVersion": "2025-06-18", "capabilities": {}},
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
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": {"content": [{"type": "text", "text": "hi from upstream"}], "isError": false},
            "id": 2,
        })))
        .mount(&server)
        .await;
    server
}

async fn seeded_dao(upstream_uri: &str) -> Arc<MemoryDao> {
    let dao = Arc::new(MemoryDao::new());
    dao.upsert_gateway(GatewayRecord {
        id: "g1".into(),
        url: format!("{upstream_uri}/mcp"),
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
        id: "t-echo".into(),
        gateway_id: Some("g1".into()),
        team_id: None,
        owner_id: None,
        name: "echo".into(),
        integration: Integration::Mcp {
            remote_name: "echo".into(),
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
    dao
}

async fn worker(
    name: &str,
    cache: &Arc<dyn Cache>,
    dao: &Arc<MemoryDao>,
) -> (Arc<AppContext>, axum::Router) {
    let mut config = GatewayConfig::default();
    config.auth.anonymous_enabled = true;
    config.server.worker_id = name.to_string();
    let ctx = Arc::new(
        AppContext::build(
            config,
            Some(Arc::clone(dao) as Arc<dyn Dao>),
            Some(Arc::clone(cache)),
        )
        .await
        .unwrap(),
    );
    let app = router(Arc::clone(&ctx));
    (ctx, app)
}

/// Bind a real listener and serve a fully wired worker on it.
async fn spawn_listening_worker(
    name: &str,
    cache: &Arc<dyn Cache>,
    dao: &Arc<MemoryDao>,
) -> (Arc<AppContext>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = GatewayConfig::default();
    config.auth.anonymous_enabled = true;
    config.server.worker_id = name.to_string();
    config.server.bind_addr = addr.to_string();
    config.server.advertise_addr = format!("http://{addr}");
    let ctx = Arc::new(
        AppContext::build(
            config,
            Some(Arc::clone(dao) as Arc<dyn Dao>),
            Some(Arc::clone(cache)),
        )
        .await
        .unwrap(),
    );

    let app = router(Arc::clone(&ctx));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (ctx, format!("http://{addr}"))
}

/// Read SSE chunks until a predicate matches or the timeout lapses.
async fn read_sse_until(
    body: &mut (impl futures::Stream<Item = Result<bytes::Bytes, axum::Error>> + Unpin),
    predicate: impl Fn(&str) -> bool,
) -> String {
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("SSE read timed out");
        let chunk = tokio::time::timeout(remaining, body.next())
            .await
            .expect("SSE read timed out")
            .expect("SSE stream ended")
            .expect("SSE stream errored");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        if predicate(&buffer) {
            return buffer;
        }
    }
}

#[tokio::test]
async fn sse_tool_call_posted_to_another_worker_answers_on_the_owner_stream() {
    let upstream = mock_mcp_upstream().await;
    let dao = seeded_dao(&upstream.uri()).await;
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let (_ctx_a, app_a) = worker("worker-a", &cache, &dao).await;
    let (_ctx_b, app_b) = worker("worker-b", &cache, &dao).await;

    // Client opens SSE on worker A and learns its session id.
    let response = app_a
        .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();
    let opening = read_sse_until(&mut body, |b| b.contains("session_id=")).await;
    let session_id = opening
        .split("session_id=")
        .nth(1)
        .unwrap()
        .split_whitespace()
        .next()
        .unwrap()
        .trim()
        .to_string();

    // Client POSTs the request to worker B; B publishes toward the owner.
    let response = app_b
        .oneshot(
            Request::post(format!("/message?session_id={session_id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "jsonrpc": "2.0",
                        "method": "tools/call",
                        "params": {"name": "echo", "arguments": {"x": "hi"}},
                        "id": 7,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Worker A executes against the upstream and answers on its SSE stream.
    let delivered = read_sse_until(&mut body, |b| b.contains("hi from upstream")).await;
    assert!(delivered.contains("event: message") || delivered.contains("event:message"));
    assert!(delivered.contains("\"id\":7"));
}

#[tokio::test]
async fn rpc_requests_follow_session_affinity_over_http() {
    let upstream = mock_mcp_upstream().await;
    let dao = seeded_dao(&upstream.uri()).await;
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());

    let (ctx_a, addr_a) = spawn_listening_worker("worker-a", &cache, &dao).await;
    let (_ctx_b, addr_b) = spawn_listening_worker("worker-b", &cache, &dao).await;
    // Make A's address visible before B has to resolve it, so the forward
    // deterministically takes the HTTP path rather than the Pub/Sub
    // fallback.
    ctx_a.directory.advertise().await.unwrap();

    let client = reqwest::Client::new();

    // initialize on worker A mints a session owned by A.
    let response = client
        .post(format!("{addr_a}/mcp"))
        .json(&json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // The same session's tools/call lands on worker B's /rpc; B re-issues it
    // over HTTP to A with the loop-prevention header, and A answers.
    let response = client
        .post(format!("{addr_b}/rpc"))
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"x": "hi"}},
            "id": 11,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "hi from upstream");
    assert_eq!(body["id"], 11);
}

#[tokio::test]
async fn message_post_after_session_expiry_is_not_found() {
    let dao = Arc::new(MemoryDao::new());
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let (_ctx, app) = worker("worker-a", &cache, &dao).await;

    let response = app
        .oneshot(
            Request::post("/message?session_id=expired-session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "method": "ping", "id": 1}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
