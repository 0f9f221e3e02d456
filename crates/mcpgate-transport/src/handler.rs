//! The seam between transports and business logic
//!
//! Transports produce and consume opaque JSON-RPC messages; everything else
//! happens behind [`RpcHandler`]. The dispatcher implements it; transports
//! never touch federation, plugins, or the pool directly.

use async_trait::async_trait;
use http::header::HeaderMap;
use serde::{Deserialize, Serialize};

use mcpgate_core::UserContext;
use mcpgate_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Transport a logical session arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTransport {
    /// Newline-delimited stdio
    Stdio,
    /// Server-sent events with POSTed requests
    Sse,
    /// Streamable HTTP
    StreamableHttp,
    /// WebSocket frames
    WebSocket,
}

impl SessionTransport {
    /// Wire name for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
            Self::WebSocket => "websocket",
        }
    }
}

/// Request-scoped context a transport hands to the dispatcher.
#[derive(Debug, Clone)]
pub struct RequestScope {
    /// Logical session the request belongs to
    pub session_id: String,
    /// Transport the session runs over
    pub transport: SessionTransport,
    /// Authenticated caller
    pub user: UserContext,
    /// Original request headers, already authenticated but not yet scrubbed;
    /// the pool scrubs and hashes them at acquire time
    pub headers: HeaderMap,
}

/// Business-logic entry point implemented by the dispatcher.
#[async_trait]
pub trait RpcHandler: Send + Sync + std::fmt::Debug {
    /// Handle one request and produce its response. Errors are encoded into
    /// the JSON-RPC error object; this method itself is infallible.
    async fn handle(&self, request: JsonRpcRequest, scope: RequestScope) -> JsonRpcResponse;

    /// Handle a client notification. Default: ignore.
    async fn handle_notification(&self, note: JsonRpcNotification, scope: RequestScope) {
        let _ = (note, scope);
    }

    /// Client disconnect observed on a session. Implementations cancel the
    /// session's in-flight runs.
    async fn on_disconnect(&self, session_id: &str) {
        let _ = session_id;
    }
}
