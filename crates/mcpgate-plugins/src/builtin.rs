//! Built-in plugins
//!
//! Two config-driven plugins ship with the gateway: a regex deny-guard for
//! pre hooks and a PII redactor for post hooks. Both operate on the payload's
//! data side only and leave unknown fields alone.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use mcpgate_core::GatewayResult;

use crate::payload::{Hook, HookPayload, PluginOutcome, Violation};
use crate::pipeline::{Plugin, PluginContext};

const PRE_HOOKS: [Hook; 3] = [
    Hook::ToolPreInvoke,
    Hook::ResourcePreFetch,
    Hook::PromptPreFetch,
];

const POST_HOOKS: [Hook; 3] = [
    Hook::ToolPostInvoke,
    Hook::ResourcePostFetch,
    Hook::PromptPostFetch,
];

/// Blocks payloads whose serialized body matches a configured pattern.
#[derive(Debug)]
pub struct DenyPatternGuard {
    name: String,
    patterns: Vec<Regex>,
}

impl DenyPatternGuard {
    /// Compile the configured patterns.
    pub fn new(name: impl Into<String>, patterns: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
        })
    }
}

#[async_trait]
impl Plugin for DenyPatternGuard {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &[Hook] {
        &PRE_HOOKS
    }

    async fn on_hook(
        &self,
        _hook: Hook,
        payload: HookPayload,
        _ctx: &PluginContext,
    ) -> GatewayResult<PluginOutcome> {
        let body = payload.body().to_string();
        for pattern in &self.patterns {
            if pattern.is_match(&body) {
                return Ok(PluginOutcome::Violation(Violation::error(format!(
                    "argument matches denied pattern '{pattern}'"
                ))));
            }
        }
        Ok(PluginOutcome::Continue(payload))
    }
}

/// Replaces recognized PII in string values with stable placeholders.
#[derive(Debug)]
pub struct PiiRedactor {
    name: String,
    rules: Vec<(String, Regex)>,
}

impl PiiRedactor {
    /// Redactor for the given PII categories. Unknown categories are ignored.
    #[must_use]
    pub fn new(name: impl Into<String>, categories: &[String]) -> Self {
        let mut rules = Vec::new();
        for category in categories {
            let pattern = match category.as_str() {
                "email" => r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
                "ssn" => r"\b\d{3}-\d{2}-\d{4}\b",
                "phone" => r"\+?\d{1,3}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}",
                _ => continue,
            };
            rules.push((
                category.clone(),
                Regex::new(pattern).expect("built-in PII pattern compiles"),
            ));
        }
        Self {
            name: name.into(),
            rules,
        }
    }

    fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                for (category, pattern) in &self.rules {
                    if pattern.is_match(s) {
                        *s = pattern
                            .replace_all(s, format!("[{category}-redacted]").as_str())
                            .into_owned();
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.redact_value(item);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Plugin for PiiRedactor {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &[Hook] {
        &POST_HOOKS
    }

    async fn on_hook(
        &self,
        _hook: Hook,
        mut payload: HookPayload,
        _ctx: &PluginContext,
    ) -> GatewayResult<PluginOutcome> {
        self.redact_value(payload.body_mut());
        Ok(PluginOutcome::Continue(payload))
    }
}
