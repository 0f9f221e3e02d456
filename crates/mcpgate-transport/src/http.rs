//! Shared state and router for the HTTP-family transports
//!
//! The server crate mounts this router under `ROOT_PATH` next to its own
//! routes. Authentication happens in middleware upstream of these handlers;
//! the authenticated [`UserContext`] arrives as a request extension.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use mcpgate_core::GatewayError;

use crate::forward::ForwardedRpcClient;
use crate::handler::RpcHandler;
use crate::session::SessionRegistry;

/// State shared by the SSE, Streamable HTTP, and WebSocket handlers.
#[derive(Clone)]
pub struct HttpTransportState {
    /// Session ownership registry
    pub registry: Arc<SessionRegistry>,
    /// Business-logic dispatcher
    pub handler: Arc<dyn RpcHandler>,
    /// Cross-worker forwarding client
    pub forward: ForwardedRpcClient,
    /// SSE keep-alive interval
    pub keepalive: Duration,
    /// Forward to session owners instead of answering locally
    pub affinity_enabled: bool,
}

impl std::fmt::Debug for HttpTransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransportState")
            .field("worker_id", &self.registry.worker_id())
            .field("affinity_enabled", &self.affinity_enabled)
            .finish_non_exhaustive()
    }
}

/// Routes for the four client-facing transport endpoints.
pub fn router(state: HttpTransportState) -> Router {
    Router::new()
        .route("/sse", get(crate::sse::sse_handler))
        .route("/message", post(crate::sse::message_handler))
        .route("/mcp", post(crate::streamable::mcp_handler))
        .route("/ws", get(crate::websocket::ws_handler))
        .with_state(state)
}

/// Encode a gateway error as an HTTP response with a JSON body.
pub fn error_response(err: &GatewayError) -> Response {
    let status = err.http_status();
    let body = axum::Json(serde_json::json!({ "error": err.to_rpc_error() }));
    (status, body).into_response()
}
