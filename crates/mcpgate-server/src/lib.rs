//! # mcpgate-server
//!
//! The gateway's HTTP surface and component wiring. The binary lives in
//! `main.rs`; this library exists so integration tests can build an
//! [`AppContext`] and drive the router in-process.

pub mod app;
pub mod http;

pub use app::AppContext;
pub use http::{FORWARDED_INTERNALLY, router};
