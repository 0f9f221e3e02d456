//! # mcpgate-transport
//!
//! The four client-facing transports (stdio, SSE, Streamable HTTP,
//! WebSocket) sharing one logical session model, the cross-worker session
//! registry, and the forwarded-RPC plumbing between workers.
//!
//! Transports end at producing and consuming opaque JSON-RPC messages;
//! dispatch goes through the [`handler::RpcHandler`] seam.

pub mod directory;
pub mod forward;
pub mod handler;
pub mod http;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod streamable;
pub mod websocket;

pub use directory::WorkerDirectory;
pub use forward::{ForwardedRpc, ForwardedRpcClient, spawn_forward_listener};
pub use handler::{RequestScope, RpcHandler, SessionTransport};
pub use http::{HttpTransportState, error_response, router};
pub use session::{LocalSession, SessionRegistry};
pub use stdio::serve_stdio;
