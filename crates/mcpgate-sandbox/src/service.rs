//! The code-execution service
//!
//! Front door for the two meta-tools. `shell_exec` resolves the caller's
//! deterministic session, screens and runs the code under the server's
//! sandbox policy, and applies tokenization at the boundary; `fs_browse`
//! serves confined reads over the session tree. Bridged tool calls are
//! checked against the server's permissions before they reach the injected
//! [`ToolBridge`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use mcpgate_core::cache::Cache;
use mcpgate_core::config::CodeExecutionSettings;
use mcpgate_core::dao::{Dao, ServerType, VirtualServerRecord};
use mcpgate_core::{GatewayError, GatewayResult, UserContext};

use crate::bridge::{BridgePolicy, ToolBridge};
use crate::exec::{ExecArgs, run_code};
use crate::session::{CodeExecSessions, SessionHandle};
use crate::tokenize::Tokenizer;
use crate::vfs::{BrowseArgs, browse};

/// Code-execution front door, one per worker.
pub struct CodeExecutionService {
    settings: CodeExecutionSettings,
    sessions: CodeExecSessions,
    dao: Arc<dyn Dao>,
    bridge: Option<Arc<dyn ToolBridge>>,
}

impl std::fmt::Debug for CodeExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExecutionService")
            .field("enabled", &self.settings.enabled)
            .finish_non_exhaustive()
    }
}

impl CodeExecutionService {
    /// Service over the shared volume and registry. `bridge` carries
    /// sandbox-initiated tool calls back into the dispatcher.
    pub fn new(
        settings: CodeExecutionSettings,
        cache: Arc<dyn Cache>,
        dao: Arc<dyn Dao>,
        bridge: Option<Arc<dyn ToolBridge>>,
    ) -> Self {
        Self {
            sessions: CodeExecSessions::new(settings.clone(), cache, Arc::clone(&dao)),
            settings,
            dao,
            bridge,
        }
    }

    /// Run code in the caller's session.
    pub async fn shell_exec(
        &self,
        server_id: &str,
        user: &UserContext,
        args: Value,
    ) -> GatewayResult<Value> {
        if !self.settings.enabled || !self.settings.shell_exec_enabled {
            return Err(GatewayError::forbidden("shell_exec is disabled"));
        }
        let args: ExecArgs = serde_json::from_value(args)
            .map_err(|e| GatewayError::invalid_request(format!("shell_exec args: {e}")))?;
        let server = self.code_server(server_id).await?;
        let email = caller_email(user);

        let handle = self
            .sessions
            .ensure_session(&server, &email, &args.language)
            .await?;

        // Tokenize inbound code, run, detokenize captured output.
        let tokenizer = Tokenizer::new(&server.tokenization);
        let mut mapping: HashMap<String, String> = handle.row.tokens.clone();
        let code = if tokenizer.is_active() {
            tokenizer.tokenize(&args.code, &mut mapping)
        } else {
            args.code.clone()
        };

        let outcome = run_code(
            &handle.root,
            &ExecArgs {
                code,
                language: args.language.clone(),
            },
            &server.sandbox_policy,
        )
        .await?;

        self.sessions
            .touch(server_id, &email, &args.language)
            .await;

        let mut result = outcome.to_value();
        if tokenizer.is_active() {
            result["stdout"] = json!(Tokenizer::detokenize(
                result["stdout"].as_str().unwrap_or_default(),
                &mapping
            ));
            result["stderr"] = json!(Tokenizer::detokenize(
                result["stderr"].as_str().unwrap_or_default(),
                &mapping
            ));
        }
        debug!(server_id, session_id = %handle.session_id, "shell_exec completed");
        Ok(result)
    }

    /// Browse the caller's session tree.
    pub async fn fs_browse(
        &self,
        server_id: &str,
        user: &UserContext,
        args: Value,
    ) -> GatewayResult<Value> {
        if !self.settings.enabled || !self.settings.fs_browse_enabled {
            return Err(GatewayError::forbidden("fs_browse is disabled"));
        }
        let language = args
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("python")
            .to_string();
        let args: BrowseArgs = serde_json::from_value(args)
            .map_err(|e| GatewayError::invalid_request(format!("fs_browse args: {e}")))?;
        let server = self.code_server(server_id).await?;
        let email = caller_email(user);

        let handle = self.sessions.ensure_session(&server, &email, &language).await?;
        let result = browse(&handle.root, args).await?;
        self.sessions.touch(server_id, &email, &language).await;
        Ok(result)
    }

    /// A tool call initiated by sandboxed code, checked against the server's
    /// permissions and depth bound, carrying the scrubbed caller identity.
    pub async fn bridge_call(
        &self,
        server_id: &str,
        user: &UserContext,
        tool_name: &str,
        args: Value,
        depth: u32,
    ) -> GatewayResult<Value> {
        let bridge = self
            .bridge
            .as_ref()
            .ok_or_else(|| GatewayError::forbidden("tool bridge is not wired"))?;
        let server = self.code_server(server_id).await?;
        let policy = BridgePolicy::compile(
            &server.sandbox_policy.tool_call_permissions,
            server.sandbox_policy.max_bridge_depth,
        )?;
        policy.check(tool_name, depth)?;

        let scrubbed = user.scrubbed(&["clearance", "sso_token", "api_key"].map(String::from));
        bridge.invoke(tool_name, args, &scrubbed).await
    }

    async fn code_server(&self, server_id: &str) -> GatewayResult<VirtualServerRecord> {
        let server = self
            .dao
            .get_virtual_server(server_id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("virtual server '{server_id}'")))?;
        if server.server_type != ServerType::CodeExecution {
            return Err(GatewayError::forbidden(format!(
                "server '{server_id}' is not a code-execution server"
            )));
        }
        Ok(server)
    }
}

fn caller_email(user: &UserContext) -> String {
    user.email.clone().unwrap_or_else(|| user.user_id.clone())
}
