//! # mcpgate-plugins
//!
//! Ordered pre/post hook pipeline around every tool, resource, and prompt
//! invocation. Violations are a dedicated outcome type rather than errors;
//! the registered mode decides whether a violation aborts the request.

pub mod builtin;
pub mod payload;
pub mod pipeline;

pub use builtin::{DenyPatternGuard, PiiRedactor};
pub use payload::{Hook, HookPayload, PluginOutcome, Violation};
pub use pipeline::{Plugin, PluginContext, PluginMode, PluginPipeline};
