//! Hook points and typed payloads
//!
//! Six hooks surround every tool, resource, and prompt invocation. Payloads
//! are schema'd records that keep unknown fields as opaque pass-through, so a
//! plugin written against an older payload shape round-trips newer fields
//! untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mcpgate_core::ViolationSeverity;

/// The six pipeline hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Before a prompt renders
    PromptPreFetch,
    /// After a prompt renders
    PromptPostFetch,
    /// Before a tool runs
    ToolPreInvoke,
    /// After a tool runs
    ToolPostInvoke,
    /// Before a resource read
    ResourcePreFetch,
    /// After a resource read
    ResourcePostFetch,
}

impl Hook {
    /// Wire name of the hook.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PromptPreFetch => "prompt_pre_fetch",
            Self::PromptPostFetch => "prompt_post_fetch",
            Self::ToolPreInvoke => "tool_pre_invoke",
            Self::ToolPostInvoke => "tool_post_invoke",
            Self::ResourcePreFetch => "resource_pre_fetch",
            Self::ResourcePostFetch => "resource_post_fetch",
        }
    }
}

/// Payload before a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPreInvokePayload {
    /// Tool name
    pub name: String,
    /// Tool arguments
    pub args: Value,
    /// Unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload after a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPostInvokePayload {
    /// Tool name
    pub name: String,
    /// Tool result
    pub result: Value,
    /// Unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload before a resource fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePreFetchPayload {
    /// Resource URI
    pub uri: String,
    /// Fetch parameters
    pub params: Value,
    /// Unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload after a resource fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePostFetchPayload {
    /// Resource URI
    pub uri: String,
    /// Fetched content
    pub content: Value,
    /// Unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload before a prompt render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPreFetchPayload {
    /// Prompt name
    pub name: String,
    /// Render arguments
    pub args: Value,
    /// Unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload after a prompt render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPostFetchPayload {
    /// Prompt name
    pub name: String,
    /// Rendered prompt
    pub rendered: Value,
    /// Unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One payload per hook point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookPayload {
    /// `tool_pre_invoke`
    ToolPre(ToolPreInvokePayload),
    /// `tool_post_invoke`
    ToolPost(ToolPostInvokePayload),
    /// `resource_pre_fetch`
    ResourcePre(ResourcePreFetchPayload),
    /// `resource_post_fetch`
    ResourcePost(ResourcePostFetchPayload),
    /// `prompt_pre_fetch`
    PromptPre(PromptPreFetchPayload),
    /// `prompt_post_fetch`
    PromptPost(PromptPostFetchPayload),
}

impl HookPayload {
    /// Payload before a tool invocation.
    #[must_use]
    pub fn tool_pre(name: impl Into<String>, args: Value) -> Self {
        Self::ToolPre(ToolPreInvokePayload {
            name: name.into(),
            args,
            extra: Map::new(),
        })
    }

    /// Payload after a tool invocation.
    #[must_use]
    pub fn tool_post(name: impl Into<String>, result: Value) -> Self {
        Self::ToolPost(ToolPostInvokePayload {
            name: name.into(),
            result,
            extra: Map::new(),
        })
    }

    /// Payload before a resource fetch.
    #[must_use]
    pub fn resource_pre(uri: impl Into<String>, params: Value) -> Self {
        Self::ResourcePre(ResourcePreFetchPayload {
            uri: uri.into(),
            params,
            extra: Map::new(),
        })
    }

    /// Payload after a resource fetch.
    #[must_use]
    pub fn resource_post(uri: impl Into<String>, content: Value) -> Self {
        Self::ResourcePost(ResourcePostFetchPayload {
            uri: uri.into(),
            content,
            extra: Map::new(),
        })
    }

    /// Payload before a prompt render.
    #[must_use]
    pub fn prompt_pre(name: impl Into<String>, args: Value) -> Self {
        Self::PromptPre(PromptPreFetchPayload {
            name: name.into(),
            args,
            extra: Map::new(),
        })
    }

    /// Payload after a prompt render.
    #[must_use]
    pub fn prompt_post(name: impl Into<String>, rendered: Value) -> Self {
        Self::PromptPost(PromptPostFetchPayload {
            name: name.into(),
            rendered,
            extra: Map::new(),
        })
    }

    /// The mutable data side of the payload (args, result, content, or
    /// rendered output), for content-scanning plugins.
    #[must_use]
    pub fn body(&self) -> &Value {
        match self {
            Self::ToolPre(p) => &p.args,
            Self::ToolPost(p) => &p.result,
            Self::ResourcePre(p) => &p.params,
            Self::ResourcePost(p) => &p.content,
            Self::PromptPre(p) => &p.args,
            Self::PromptPost(p) => &p.rendered,
        }
    }

    /// Mutable access to the data side of the payload.
    pub fn body_mut(&mut self) -> &mut Value {
        match self {
            Self::ToolPre(p) => &mut p.args,
            Self::ToolPost(p) => &mut p.result,
            Self::ResourcePre(p) => &mut p.params,
            Self::ResourcePost(p) => &mut p.content,
            Self::PromptPre(p) => &mut p.args,
            Self::PromptPost(p) => &mut p.rendered,
        }
    }

    /// Subject name or URI the payload refers to.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::ToolPre(p) => &p.name,
            Self::ToolPost(p) => &p.name,
            Self::ResourcePre(p) => &p.uri,
            Self::ResourcePost(p) => &p.uri,
            Self::PromptPre(p) => &p.name,
            Self::PromptPost(p) => &p.name,
        }
    }
}

/// A policy violation raised by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Severity of the finding
    pub severity: ViolationSeverity,
    /// Human-readable reason; surfaced to the caller in enforce mode
    pub reason: String,
}

impl Violation {
    /// Error-severity violation.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            severity: ViolationSeverity::Error,
            reason: reason.into(),
        }
    }

    /// Warning-severity violation.
    #[must_use]
    pub fn warning(reason: impl Into<String>) -> Self {
        Self {
            severity: ViolationSeverity::Warning,
            reason: reason.into(),
        }
    }
}

/// What a plugin did with a payload.
#[derive(Debug, Clone)]
pub enum PluginOutcome {
    /// Pass the (possibly mutated) payload to the next plugin
    Continue(HookPayload),
    /// Block the request
    Violation(Violation),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn unknown_fields_round_trip() {
        let wire = json!({
            "name": "echo",
            "args": {"x": 1},
            "trace_hint": "abc123",
        });
        let payload: ToolPreInvokePayload = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(payload.extra["trace_hint"], "abc123");
        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back, wire);
    }

    #[test]
    fn hook_wire_names() {
        assert_eq!(Hook::ToolPreInvoke.as_str(), "tool_pre_invoke");
        assert_eq!(Hook::ResourcePostFetch.as_str(), "resource_post_fetch");
    }

    #[test]
    fn body_selects_the_data_side() {
        let payload = HookPayload::tool_post("echo", json!({"out": "hi"}));
        assert_eq!(payload.body(), &json!({"out": "hi"}));
        assert_eq!(payload.subject(), "echo");
    }
}
