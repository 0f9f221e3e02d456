//! # mcpgate-sandbox
//!
//! Deterministic per-user code-execution sessions: a virtual filesystem
//! (`/tools`, `/skills`, `/scratch`, `/results`) on a shared volume, a
//! cache-backed session registry, code screening and execution under a
//! sandbox policy, PII tokenization at the boundary, and the permission
//! gate for sandbox-initiated tool calls.

pub mod bridge;
pub mod exec;
pub mod service;
pub mod session;
pub mod tokenize;
pub mod vfs;

pub use bridge::{BridgePolicy, ToolBridge};
pub use service::CodeExecutionService;
pub use session::{CodeExecSessions, SessionHandle, session_id, session_root, slug};
pub use tokenize::Tokenizer;
