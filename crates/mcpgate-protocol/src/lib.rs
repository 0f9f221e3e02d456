//! # mcpgate-protocol
//!
//! JSON-RPC 2.0 wire types shared by every layer of the gateway, plus the
//! MCP method names the gateway routes on. The gateway treats message
//! payloads as opaque `serde_json::Value`s; only the envelope is typed.

pub mod jsonrpc;
pub mod methods;

pub use jsonrpc::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload,
    JsonRpcVersion, RequestId, ResponseId, JSONRPC_VERSION,
};
