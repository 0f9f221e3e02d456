//! Tool bridge policy
//!
//! Sandbox-invoked tool calls route back through the gateway's dispatcher,
//! subject to the server's `tool_call_permissions` (allow/deny glob patterns
//! by tool name) and a bounded recursion depth. The dispatcher side is
//! injected as a [`ToolBridge`] so this crate stays free of federation
//! dependencies.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;

use mcpgate_core::dao::ToolCallPermissions;
use mcpgate_core::{GatewayError, GatewayResult, UserContext};

/// Gateway-side sink for bridged tool calls; the server wires the
/// dispatcher in here.
#[async_trait]
pub trait ToolBridge: Send + Sync + std::fmt::Debug {
    /// Invoke a tool on behalf of sandboxed code.
    async fn invoke(&self, name: &str, args: Value, user: &UserContext) -> GatewayResult<Value>;
}

/// Compiled bridge policy for one virtual server.
#[derive(Debug)]
pub struct BridgePolicy {
    allow: Option<GlobSet>,
    deny: GlobSet,
    max_depth: u32,
}

impl BridgePolicy {
    /// Compile the server's permissions. An empty allow list admits every
    /// tool; deny patterns are evaluated after allow.
    pub fn compile(
        permissions: &ToolCallPermissions,
        max_depth: u32,
    ) -> GatewayResult<Self> {
        let allow = if permissions.allow.is_empty() {
            None
        } else {
            Some(build_globset(&permissions.allow)?)
        };
        let deny = build_globset(&permissions.deny)?;
        Ok(Self {
            allow,
            deny,
            max_depth,
        })
    }

    /// Whether a bridged call to `tool_name` at `depth` may proceed.
    pub fn check(&self, tool_name: &str, depth: u32) -> GatewayResult<()> {
        if depth >= self.max_depth {
            return Err(GatewayError::forbidden(format!(
                "tool bridge depth {depth} exceeds the configured bound"
            )));
        }
        if let Some(allow) = &self.allow
            && !allow.is_match(tool_name)
        {
            return Err(GatewayError::forbidden(format!(
                "tool '{tool_name}' is not in the sandbox allow list"
            )));
        }
        if self.deny.is_match(tool_name) {
            return Err(GatewayError::forbidden(format!(
                "tool '{tool_name}' is denied for sandboxed code"
            )));
        }
        Ok(())
    }
}

fn build_globset(patterns: &[String]) -> GatewayResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| GatewayError::internal(format!("bad tool pattern: {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| GatewayError::internal(format!("tool pattern set: {e}")))
}
