//! HTTP surface
//!
//! Mounts the transport routes next to the gateway's own endpoints: the
//! internal RPC dispatcher, cancellation, REST passthrough, and the health
//! probe. Authentication runs as middleware in front of everything except
//! `/healthz`; handlers read the caller from request extensions.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Extension, Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use mcpgate_core::UserContext;
use mcpgate_core::dao::Integration;
use mcpgate_federation::PassthroughRequest;
use mcpgate_protocol::JsonRpcRequest;
use mcpgate_transport::{RequestScope, RpcHandler, SessionTransport, error_response};

use crate::app::AppContext;

/// Internal loop-prevention header set on forwarded calls.
pub const FORWARDED_INTERNALLY: &str = "x-forwarded-internally";

/// Build the complete router for one worker.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let transport_routes = mcpgate_transport::router(ctx.transport_state());
    let gateway_routes = Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/cancellation/cancel", post(cancel_handler))
        .route("/cancellation/status/{id}", get(cancel_status_handler))
        .route("/passthrough/{ns}/{tool_id}", any(passthrough_root))
        .route("/passthrough/{ns}/{tool_id}/{*path}", any(passthrough_path))
        .with_state(Arc::clone(&ctx));

    let authenticated = transport_routes
        .merge(gateway_routes)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(Arc::clone(&ctx))
        .merge(authenticated);

    let root = ctx.config.server.root_path.trim_end_matches('/');
    if root.is_empty() {
        app
    } else {
        Router::new().nest(root, app)
    }
}

async fn auth_middleware(
    State(ctx): State<Arc<AppContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    match ctx.authenticator.authenticate(request.headers()) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => error_response(&err),
    }
}

/// `POST /rpc`: internal dispatcher. Honors `X-Forwarded-Internally: true`
/// by answering locally regardless of session affinity.
///
/// When the session is owned elsewhere, the request is re-issued over HTTP
/// to the owner's `/rpc` with the loop-prevention header set; the cache
/// Pub/Sub path is the fallback for peers that have not advertised an
/// address.
async fn rpc_handler(
    State(ctx): State<Arc<AppContext>>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("malformed request: {e}")})),
            )
                .into_response();
        }
    };

    let forwarded_internally = headers
        .get(FORWARDED_INTERNALLY)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let session_id = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("rpc-{}", uuid::Uuid::new_v4()));

    // Affinity redirection is skipped for internally forwarded calls; the
    // forwarding worker already made the placement decision.
    if !forwarded_internally
        && ctx.config.session.affinity_enabled
        && !ctx.registry.owns(&session_id)
    {
        match ctx.registry.lookup(&session_id).await {
            Ok(Some(owner)) => {
                return forward_rpc(&ctx, &owner, &session_id, &request, &headers, &body).await;
            }
            Ok(None) => {}
            Err(err) => return error_response(&err),
        }
    }

    let scope = RequestScope {
        session_id,
        transport: SessionTransport::StreamableHttp,
        user,
        headers,
    };
    let response = ctx.dispatcher.handle(request, scope).await;
    Json(response).into_response()
}

/// Forward an `/rpc` request to the owning worker.
async fn forward_rpc(
    ctx: &Arc<AppContext>,
    owner: &str,
    session_id: &str,
    request: &JsonRpcRequest,
    headers: &HeaderMap,
    body: &str,
) -> Response {
    match ctx.directory.lookup(owner).await {
        Ok(Some(addr)) => forward_rpc_http(ctx, owner, &addr, headers, body).await,
        Ok(None) => {
            // Peer not in the directory (older deployment or expired entry):
            // fall back to the cache Pub/Sub forwarding path.
            debug!(owner, session_id, "owner unadvertised; forwarding via pubsub");
            let forward = ctx.transport_state().forward;
            match forward.forward(owner, session_id, request).await {
                Ok(response) => Json(response).into_response(),
                Err(err) => error_response(&err),
            }
        }
        Err(err) => error_response(&err),
    }
}

async fn forward_rpc_http(
    ctx: &Arc<AppContext>,
    owner: &str,
    addr: &str,
    headers: &HeaderMap,
    body: &str,
) -> Response {
    let root = ctx.config.server.root_path.trim_end_matches('/');
    let url = format!("{}{root}/rpc", addr.trim_end_matches('/'));

    let mut forwarded = headers.clone();
    for name in ["host", "content-length", "connection", "transfer-encoding"] {
        forwarded.remove(name);
    }
    forwarded.insert(
        FORWARDED_INTERNALLY,
        axum::http::HeaderValue::from_static("true"),
    );

    debug!(owner, url = %url, "forwarding rpc over http");
    let upstream = ctx
        .peer_client
        .post(&url)
        .headers(forwarded)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .send()
        .await;

    match upstream {
        Ok(response) => {
            let status = response.status();
            match response.text().await {
                Ok(text) => (
                    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    text,
                )
                    .into_response(),
                Err(e) => error_response(&mcpgate_core::GatewayError::unavailable(format!(
                    "forwarded rpc body from '{owner}': {e}"
                ))),
            }
        }
        Err(e) => {
            warn!(owner, error = %e, "http rpc forward failed");
            let err = if e.is_timeout() {
                mcpgate_core::GatewayError::unavailable(format!(
                    "forwarded rpc to '{owner}' timed out"
                ))
            } else {
                mcpgate_core::GatewayError::unavailable(format!(
                    "forwarded rpc to '{owner}': {e}"
                ))
            };
            error_response(&err)
        }
    }
}

/// Body of `POST /cancellation/cancel`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    request_id: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_handler(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CancelBody>,
) -> Response {
    match ctx
        .cancellations
        .cancel_run(&body.request_id, body.reason)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn cancel_status_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(request_id): Path<String>,
) -> Response {
    match ctx.cancellations.status(&request_id) {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown run '{request_id}'")})),
        )
            .into_response(),
    }
}

async fn passthrough_root(
    State(ctx): State<Arc<AppContext>>,
    Path((ns, tool_id)): Path<(String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    Extension(user): Extension<UserContext>,
    request: Request,
) -> Response {
    serve_passthrough(ctx, ns, tool_id, String::new(), query, user, request).await
}

async fn passthrough_path(
    State(ctx): State<Arc<AppContext>>,
    Path((ns, tool_id, path)): Path<(String, String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    Extension(user): Extension<UserContext>,
    request: Request,
) -> Response {
    serve_passthrough(ctx, ns, tool_id, path, query, user, request).await
}

async fn serve_passthrough(
    ctx: Arc<AppContext>,
    namespace: String,
    tool_id: String,
    path: String,
    query: Vec<(String, String)>,
    user: UserContext,
    request: Request,
) -> Response {
    if !ctx.config.passthrough.expose_passthrough {
        return error_response(&mcpgate_core::GatewayError::forbidden(
            "passthrough is not exposed on this gateway",
        ));
    }

    let tool = match ctx.dispatcher.catalog().tool_by_id(&tool_id, &user).await {
        Ok(tool) => tool,
        Err(err) => return error_response(&err),
    };
    let Integration::Rest(rest) = tool.integration.clone() else {
        return error_response(&mcpgate_core::GatewayError::not_found(format!(
            "tool '{tool_id}' is not a REST passthrough"
        )));
    };

    let method = request.method().as_str().to_string();
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(
        request.into_body(),
        ctx.config.passthrough.max_request_bytes + 1,
    )
    .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "passthrough body read failed");
            return error_response(&mcpgate_core::GatewayError::PayloadTooLarge {
                actual: ctx.config.passthrough.max_request_bytes + 1,
                limit: ctx.config.passthrough.max_request_bytes,
            });
        }
    };

    let passthrough_request = PassthroughRequest {
        method,
        path,
        query,
        headers,
        body: Bytes::from(body),
    };

    match ctx
        .passthrough
        .execute(&namespace, &tool, &rest, passthrough_request, &user)
        .await
    {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = axum::http::Response::builder().status(status);
            if let Some(content_type) = response.headers.get(http::header::CONTENT_TYPE) {
                builder = builder.header(http::header::CONTENT_TYPE, content_type);
            }
            builder
                .body(axum::body::Body::from(response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => error_response(&err),
    }
}

async fn healthz(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(json!({
        "status": "ok",
        "worker_id": ctx.registry.worker_id(),
        "sessions": ctx.registry.local_count(),
        "active_runs": ctx.cancellations.active_runs(),
        "pool": ctx.pool.metrics(),
    }))
    .into_response()
}
