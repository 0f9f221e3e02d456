//! Plugin trait, registry, and pipeline execution
//!
//! Plugins run strictly sequentially in declared order within a hook. A
//! violation is data, not an error: the configured mode decides whether it
//! aborts the request or is merely logged. Genuine plugin failures map to
//! `Internal` except under `enforce_ignore_error`, which proceeds as if the
//! plugin were absent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mcpgate_core::{GatewayError, GatewayResult, UserContext};

use crate::payload::{Hook, HookPayload, PluginOutcome};

/// Violation handling policy for one registered plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMode {
    /// Abort the request on violation; plugin errors are internal errors
    #[default]
    Enforce,
    /// Abort on violation; on plugin error proceed as if the plugin were
    /// absent
    EnforceIgnoreError,
    /// Log violations and continue
    Permissive,
    /// Skip the plugin entirely
    Disabled,
}

/// Request-scoped context handed to every plugin.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Caller identity
    pub user: UserContext,
    /// Request id of the run, when one exists
    pub request_id: Option<String>,
    /// Extra metadata plugins may read
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PluginContext {
    /// Context for the given caller.
    #[must_use]
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            request_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach the run's request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// A pipeline plugin.
///
/// Implementations must be deterministic with respect to their inputs for a
/// given configuration, and must treat payload fields they do not understand
/// as opaque pass-through.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Hooks this plugin participates in.
    fn hooks(&self) -> &[Hook];

    /// Inspect or transform a payload.
    async fn on_hook(
        &self,
        hook: Hook,
        payload: HookPayload,
        ctx: &PluginContext,
    ) -> GatewayResult<PluginOutcome>;
}

/// One configured plugin with its violation policy.
#[derive(Debug, Clone)]
pub struct PluginRegistration {
    /// The plugin
    pub plugin: Arc<dyn Plugin>,
    /// Violation handling mode
    pub mode: PluginMode,
}

/// Ordered plugin pipeline with per-entity chain overrides.
#[derive(Debug, Default)]
pub struct PluginPipeline {
    registrations: Vec<PluginRegistration>,
}

impl PluginPipeline {
    /// Empty pipeline; every hook is a no-op.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin with a mode. Declaration order is execution order.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>, mode: PluginMode) {
        self.registrations.push(PluginRegistration { plugin, mode });
    }

    /// Names of all registered plugins, in order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.registrations
            .iter()
            .map(|r| r.plugin.name().to_string())
            .collect()
    }

    /// Run the chain for `hook` over `payload`.
    ///
    /// `chain_override` is the entity's configured chain: when non-empty, only
    /// the named plugins run, in the listed order. Otherwise every registered
    /// plugin subscribed to the hook runs in registration order.
    pub async fn run(
        &self,
        hook: Hook,
        payload: HookPayload,
        ctx: &PluginContext,
        chain_override: &[String],
    ) -> GatewayResult<HookPayload> {
        let chain = self.resolve_chain(hook, chain_override);
        let mut current = payload;

        for registration in chain {
            let plugin = &registration.plugin;
            if registration.mode == PluginMode::Disabled {
                continue;
            }
            match plugin.on_hook(hook, current.clone(), ctx).await {
                Ok(PluginOutcome::Continue(next)) => {
                    current = next;
                }
                Ok(PluginOutcome::Violation(violation)) => match registration.mode {
                    PluginMode::Permissive => {
                        warn!(
                            plugin = plugin.name(),
                            hook = hook.as_str(),
                            reason = %violation.reason,
                            "permissive plugin violation"
                        );
                    }
                    PluginMode::Enforce | PluginMode::EnforceIgnoreError => {
                        return Err(GatewayError::PolicyViolation {
                            plugin: plugin.name().to_string(),
                            severity: violation.severity,
                            reason: violation.reason,
                        });
                    }
                    PluginMode::Disabled => unreachable!("disabled plugins are skipped"),
                },
                Err(err) if registration.mode == PluginMode::EnforceIgnoreError => {
                    warn!(
                        plugin = plugin.name(),
                        hook = hook.as_str(),
                        error = %err,
                        "plugin error ignored per mode"
                    );
                }
                Err(err) => {
                    return Err(GatewayError::internal(format!(
                        "plugin '{}' failed on {}: {err}",
                        plugin.name(),
                        hook.as_str()
                    )));
                }
            }
        }

        Ok(current)
    }

    fn resolve_chain(&self, hook: Hook, chain_override: &[String]) -> Vec<&PluginRegistration> {
        if chain_override.is_empty() {
            return self
                .registrations
                .iter()
                .filter(|r| r.plugin.hooks().contains(&hook))
                .collect();
        }
        let mut chain = Vec::with_capacity(chain_override.len());
        for name in chain_override {
            match self
                .registrations
                .iter()
                .find(|r| r.plugin.name() == name && r.plugin.hooks().contains(&hook))
            {
                Some(registration) => chain.push(registration),
                None => {
                    debug!(plugin = %name, hook = hook.as_str(), "chain names unknown plugin");
                }
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Violation;
    use serde_json::json;

    #[derive(Debug)]
    struct Tagger {
        name: String,
        tag: String,
    }

    #[async_trait]
    impl Plugin for Tagger {
        fn name(&self) -> &str {
            &self.name
        }

        fn hooks(&self) -> &[Hook] {
            &[Hook::ToolPreInvoke]
        }

        async fn on_hook(
            &self,
            _hook: Hook,
            mut payload: HookPayload,
            _ctx: &PluginContext,
        ) -> GatewayResult<PluginOutcome> {
            if let serde_json::Value::Object(map) = payload.body_mut() {
                let seen = map
                    .entry("seen")
                    .or_insert_with(|| json!([]));
                seen.as_array_mut().unwrap().push(json!(self.tag));
            }
            Ok(PluginOutcome::Continue(payload))
        }
    }

    #[derive(Debug)]
    struct Rejector;

    #[async_trait]
    impl Plugin for Rejector {
        fn name(&self) -> &str {
            "rejector"
        }

        fn hooks(&self) -> &[Hook] {
            &[Hook::ToolPreInvoke]
        }

        async fn on_hook(
            &self,
            _hook: Hook,
            _payload: HookPayload,
            _ctx: &PluginContext,
        ) -> GatewayResult<PluginOutcome> {
            Ok(PluginOutcome::Violation(Violation::error("nope")))
        }
    }

    #[derive(Debug)]
    struct Exploder;

    #[async_trait]
    impl Plugin for Exploder {
        fn name(&self) -> &str {
            "exploder"
        }

        fn hooks(&self) -> &[Hook] {
            &[Hook::ToolPreInvoke]
        }

        async fn on_hook(
            &self,
            _hook: Hook,
            _payload: HookPayload,
            _ctx: &PluginContext,
        ) -> GatewayResult<PluginOutcome> {
            Err(GatewayError::internal("plugin blew up"))
        }
    }

    fn ctx() -> PluginContext {
        PluginContext::new(UserContext::anonymous())
    }

    #[tokio::test]
    async fn plugins_run_in_declared_order() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(
            Arc::new(Tagger {
                name: "first".into(),
                tag: "a".into(),
            }),
            PluginMode::Enforce,
        );
        pipeline.register(
            Arc::new(Tagger {
                name: "second".into(),
                tag: "b".into(),
            }),
            PluginMode::Enforce,
        );

        let out = pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(out.body()["seen"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn enforce_violation_aborts_with_plugin_name() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(Rejector), PluginMode::Enforce);

        let err = pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &[],
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::PolicyViolation { plugin, reason, .. } => {
                assert_eq!(plugin, "rejector");
                assert_eq!(reason, "nope");
            }
            other => panic!("expected PolicyViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permissive_violation_continues() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(Rejector), PluginMode::Permissive);
        pipeline.register(
            Arc::new(Tagger {
                name: "after".into(),
                tag: "ran".into(),
            }),
            PluginMode::Enforce,
        );

        let out = pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(out.body()["seen"], json!(["ran"]));
    }

    #[tokio::test]
    async fn plugin_error_is_internal_unless_ignored() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(Exploder), PluginMode::Enforce);
        let err = pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));

        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(Exploder), PluginMode::EnforceIgnoreError);
        pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_plugins_are_skipped() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(Rejector), PluginMode::Disabled);
        pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn chain_override_selects_and_orders() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(
            Arc::new(Tagger {
                name: "a".into(),
                tag: "a".into(),
            }),
            PluginMode::Enforce,
        );
        pipeline.register(
            Arc::new(Tagger {
                name: "b".into(),
                tag: "b".into(),
            }),
            PluginMode::Enforce,
        );

        let out = pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre("echo", json!({})),
                &ctx(),
                &["b".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(out.body()["seen"], json!(["b"]));
    }

    #[tokio::test]
    async fn permissive_no_mutation_is_identity() {
        let pipeline = PluginPipeline::new();
        let payload = HookPayload::tool_pre("echo", json!({"x": 1}));
        let before = serde_json::to_value(&payload).unwrap();
        let out = pipeline
            .run(Hook::ToolPreInvoke, payload, &ctx(), &[])
            .await
            .unwrap();
        assert_eq!(serde_json::to_value(&out).unwrap(), before);
    }
}
