//! RPC dispatch
//!
//! Turns a client JSON-RPC request into a concrete action: resolve the
//! entity, run the pre-hook chain, register the run for cancellation,
//! dispatch on the integration variant, run the post-hook chain, deregister.
//! Cancellation beats every other outcome, and an interrupted pooled handle
//! is dropped (closed), never returned for reuse.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, warn};

use mcpgate_core::config::{PassthroughSettings, PoolSettings};
use mcpgate_core::dao::{Dao, GatewayRecord, Integration, ToolRecord, UpstreamAuth};
use mcpgate_core::{
    Authenticator, GatewayError, GatewayResult, IdentityPropagation, UserContext,
};
use mcpgate_plugins::{Hook, HookPayload, PluginContext, PluginPipeline};
use mcpgate_pool::{AffinityOwner, PoolAffinity, UpstreamPool};
use mcpgate_protocol::{JsonRpcRequest, JsonRpcResponse, methods};
use mcpgate_transport::{RequestScope, RpcHandler};

use crate::cancellation::CancellationService;
use crate::catalog::{Catalog, Page};
use crate::graphql::execute_graphql;
use crate::grpc::execute_grpc;
use crate::passthrough::{Passthrough, PassthroughRequest};

/// Bridge into the code-execution subsystem; wired by the server when code
/// execution is enabled.
#[async_trait]
pub trait CodeExecutor: Send + Sync + std::fmt::Debug {
    /// Run code inside the sandbox session for `(server_id, user)`.
    async fn shell_exec(
        &self,
        server_id: &str,
        user: &UserContext,
        args: Value,
    ) -> GatewayResult<Value>;

    /// Browse the session's virtual filesystem.
    async fn fs_browse(
        &self,
        server_id: &str,
        user: &UserContext,
        args: Value,
    ) -> GatewayResult<Value>;
}

/// The gateway's business-logic dispatcher.
pub struct Dispatcher {
    catalog: Catalog,
    dao: Arc<dyn Dao>,
    pipeline: Arc<PluginPipeline>,
    pool: Arc<UpstreamPool>,
    affinity: PoolAffinity,
    cancellations: Arc<CancellationService>,
    authenticator: Authenticator,
    identity_propagation: IdentityPropagation,
    pool_settings: PoolSettings,
    passthrough_settings: PassthroughSettings,
    passthrough: Arc<Passthrough>,
    code_executor: Option<Arc<dyn CodeExecutor>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Wire the dispatcher. `code_executor` is `None` when code execution is
    /// disabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dao: Arc<dyn Dao>,
        pipeline: Arc<PluginPipeline>,
        pool: Arc<UpstreamPool>,
        affinity: PoolAffinity,
        cancellations: Arc<CancellationService>,
        authenticator: Authenticator,
        identity_propagation: IdentityPropagation,
        pool_settings: PoolSettings,
        passthrough_settings: PassthroughSettings,
        passthrough: Arc<Passthrough>,
        code_executor: Option<Arc<dyn CodeExecutor>>,
    ) -> GatewayResult<Self> {
        Ok(Self {
            catalog: Catalog::new(Arc::clone(&dao)),
            dao,
            pipeline,
            pool,
            affinity,
            cancellations,
            authenticator,
            identity_propagation,
            pool_settings,
            passthrough_settings,
            passthrough,
            code_executor,
            http: reqwest::Client::builder()
                .build()
                .map_err(|e| GatewayError::internal(format!("dispatch client: {e}")))?,
        })
    }

    /// The catalog, for list endpoints.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The cancellation service, for the HTTP cancel endpoints.
    #[must_use]
    pub fn cancellations(&self) -> &Arc<CancellationService> {
        &self.cancellations
    }

    /// Invoke a tool on behalf of the caller.
    pub async fn invoke_tool(
        &self,
        name: &str,
        args: Value,
        scope: &RequestScope,
        request_id: &str,
    ) -> GatewayResult<Value> {
        let tool = self.catalog.resolve_tool(name, &scope.user).await?;

        let ctx = PluginContext::new(scope.user.clone()).with_request_id(request_id);
        let payload = self
            .pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre(name, args),
                &ctx,
                &tool.plugin_pre_chain,
            )
            .await?;
        let args = payload.body().clone();

        let token = self
            .cancellations
            .register_run(request_id, name, Some(&scope.session_id));

        let outcome = tokio::select! {
            () = token.cancelled() => Err(GatewayError::cancelled("run cancelled")),
            result = self.dispatch_integration(&tool, args, scope) => result,
        };
        // Cancellation skips the post chain; failures skip it too.
        let outcome = match outcome {
            Ok(result) => {
                self.pipeline
                    .run(
                        Hook::ToolPostInvoke,
                        HookPayload::tool_post(name, result),
                        &ctx,
                        &tool.plugin_post_chain,
                    )
                    .await
                    .map(|payload| payload.body().clone())
            }
            Err(err) => Err(err),
        };
        self.cancellations.deregister_run(request_id);
        outcome
    }

    /// Read a resource on behalf of the caller.
    pub async fn read_resource(
        &self,
        uri: &str,
        params: Value,
        scope: &RequestScope,
        request_id: &str,
    ) -> GatewayResult<Value> {
        let resource = self.catalog.resolve_resource(uri, &scope.user).await?;

        let ctx = PluginContext::new(scope.user.clone()).with_request_id(request_id);
        let payload = self
            .pipeline
            .run(
                Hook::ResourcePreFetch,
                HookPayload::resource_pre(uri, params),
                &ctx,
                &resource.plugin_pre_chain,
            )
            .await?;
        let _params = payload.body().clone();

        let token = self
            .cancellations
            .register_run(request_id, uri, Some(&scope.session_id));

        let fetched = tokio::select! {
            () = token.cancelled() => Err(GatewayError::cancelled("run cancelled")),
            result = self.fetch_resource(&resource, scope) => result,
        };
        let outcome = match fetched {
            Ok(content) => self
                .pipeline
                .run(
                    Hook::ResourcePostFetch,
                    HookPayload::resource_post(uri, content),
                    &ctx,
                    &resource.plugin_post_chain,
                )
                .await
                .map(|payload| payload.body().clone()),
            Err(err) => Err(err),
        };
        self.cancellations.deregister_run(request_id);
        outcome
    }

    /// Render a prompt on behalf of the caller.
    pub async fn get_prompt(
        &self,
        name: &str,
        args: Value,
        scope: &RequestScope,
        request_id: &str,
    ) -> GatewayResult<Value> {
        let prompt = self.catalog.resolve_prompt(name, &scope.user).await?;

        let ctx = PluginContext::new(scope.user.clone()).with_request_id(request_id);
        let payload = self
            .pipeline
            .run(
                Hook::PromptPreFetch,
                HookPayload::prompt_pre(name, args),
                &ctx,
                &prompt.plugin_pre_chain,
            )
            .await?;
        let args = payload.body().clone();

        let rendered = if let Some(gateway_id) = &prompt.gateway_id {
            let gateway = self.gateway(gateway_id).await?;
            self.call_upstream_mcp(
                &gateway,
                scope,
                methods::PROMPTS_GET,
                json!({"name": prompt.name, "arguments": args}),
            )
            .await?
        } else {
            let template = prompt.template.clone().ok_or_else(|| {
                GatewayError::not_found(format!("prompt '{name}' has no template"))
            })?;
            json!({
                "messages": [{
                    "role": "user",
                    "content": {"type": "text", "text": render_template(&template, &args)},
                }],
            })
        };

        let payload = self
            .pipeline
            .run(
                Hook::PromptPostFetch,
                HookPayload::prompt_post(name, rendered),
                &ctx,
                &prompt.plugin_post_chain,
            )
            .await?;
        Ok(payload.body().clone())
    }

    async fn fetch_resource(
        &self,
        resource: &mcpgate_core::dao::ResourceRecord,
        scope: &RequestScope,
    ) -> GatewayResult<Value> {
        if let Some(gateway_id) = &resource.gateway_id {
            let gateway = self.gateway(gateway_id).await?;
            return self
                .call_upstream_mcp(
                    &gateway,
                    scope,
                    methods::RESOURCES_READ,
                    json!({"uri": resource.uri}),
                )
                .await;
        }
        let content = resource.content.clone().ok_or_else(|| {
            GatewayError::not_found(format!("resource '{}' has no content", resource.uri))
        })?;
        Ok(json!({
            "contents": [{"uri": resource.uri, "mimeType": "text/plain", "text": content}],
        }))
    }

    async fn dispatch_integration(
        &self,
        tool: &ToolRecord,
        args: Value,
        scope: &RequestScope,
    ) -> GatewayResult<Value> {
        match &tool.integration {
            Integration::Mcp { remote_name } => {
                let gateway_id = tool.gateway_id.as_deref().ok_or_else(|| {
                    GatewayError::internal(format!("MCP tool '{}' has no gateway", tool.name))
                })?;
                let gateway = self.gateway(gateway_id).await?;
                let mut params = json!({"name": remote_name, "arguments": args});
                let propagation = gateway
                    .identity_propagation
                    .clone()
                    .unwrap_or_else(|| self.identity_propagation.clone());
                if let Some(meta) = self
                    .authenticator
                    .build_identity_meta(&scope.user, &propagation)
                {
                    params["_meta"] = meta;
                }
                self.call_upstream_mcp(&gateway, scope, methods::TOOLS_CALL, params)
                    .await
            }
            Integration::Rest(rest) => {
                let request = rest_request_from_args(rest, &args)?;
                let response = self
                    .passthrough
                    .call_upstream("tools", tool, rest, request, &scope.user)
                    .await?;
                Ok(json!({
                    "status_code": response.status,
                    "body": String::from_utf8_lossy(&response.body),
                    "duration_ms": response.duration_ms,
                }))
            }
            Integration::GraphQl {
                url,
                operation,
                variables_mapping,
            } => {
                let headers = self.outbound_headers(scope, None)?;
                execute_graphql(
                    &self.http,
                    url,
                    operation,
                    variables_mapping,
                    &args,
                    headers,
                    Duration::from_millis(self.passthrough_settings.default_timeout_ms),
                )
                .await
            }
            Integration::Grpc {
                endpoint,
                method_path,
            } => {
                execute_grpc(
                    endpoint,
                    method_path,
                    args,
                    self.pool_settings.transport_timeout(),
                )
                .await
            }
            Integration::CodeExecution { server_id } => {
                let executor = self.code_executor.as_ref().ok_or_else(|| {
                    GatewayError::forbidden("code execution is disabled on this gateway")
                })?;
                match tool.name.as_str() {
                    "shell_exec" => executor.shell_exec(server_id, &scope.user, args).await,
                    "fs_browse" => executor.fs_browse(server_id, &scope.user, args).await,
                    other => Err(GatewayError::not_found(format!(
                        "code-execution meta-tool '{other}'"
                    ))),
                }
            }
        }
    }

    /// One pooled MCP call with the bounded idempotent retry.
    async fn call_upstream_mcp(
        &self,
        gateway: &GatewayRecord,
        scope: &RequestScope,
        method: &str,
        params: Value,
    ) -> GatewayResult<Value> {
        let headers = self.outbound_headers(scope, gateway.identity_propagation.as_ref())?;
        let headers = apply_upstream_auth(headers, &gateway.auth)?;

        let mut attempt = 0u32;
        loop {
            let handle = self
                .pool
                .acquire(&gateway.url, headers.clone(), gateway.transport)
                .await?;
            // Record cluster-wide ownership of the upstream session so other
            // workers forward instead of duplicating it.
            if let Some(mcp_session_id) = handle.session().mcp_session_id() {
                match self.affinity.claim(mcp_session_id).await {
                    Ok(AffinityOwner::Local) => {
                        let _ = self.affinity.touch(mcp_session_id).await;
                    }
                    Ok(AffinityOwner::Remote(owner)) => {
                        warn!(
                            mcp_session_id,
                            owner = %owner,
                            "upstream session pinned to another worker"
                        );
                    }
                    Err(err) => warn!(error = %err, "affinity claim failed"),
                }
            }
            match handle.session().call(method, Some(params.clone())).await {
                Ok(result) => {
                    handle.release();
                    return Ok(result);
                }
                Err(err) => {
                    // Failed mid-call: the handle drops and the session
                    // closes. Retry once, only before any result bytes.
                    drop(handle);
                    if attempt == 0 && err.is_retryable() {
                        attempt += 1;
                        debug!(url = %gateway.url, error = %err, "retrying upstream call");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Headers for an outbound upstream call: the caller's headers scrubbed,
    /// plus freshly minted identity propagation headers.
    fn outbound_headers(
        &self,
        scope: &RequestScope,
        propagation_override: Option<&IdentityPropagation>,
    ) -> GatewayResult<HeaderMap> {
        let mut headers = scope.headers.clone();
        self.authenticator.scrub_request_headers(&mut headers);
        let propagation = propagation_override.unwrap_or(&self.identity_propagation);
        let identity = self
            .authenticator
            .build_identity_headers(&scope.user, propagation)?;
        headers.extend(identity);
        Ok(headers)
    }
}

fn apply_upstream_auth(mut headers: HeaderMap, auth: &UpstreamAuth) -> GatewayResult<HeaderMap> {
    match auth {
        UpstreamAuth::None => {}
        UpstreamAuth::Bearer { token } => {
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| GatewayError::internal(format!("upstream auth: {e}")))?,
            );
        }
        UpstreamAuth::Basic { username, password } => {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {encoded}"))
                    .map_err(|e| GatewayError::internal(format!("upstream auth: {e}")))?,
            );
        }
        UpstreamAuth::Headers { headers: extra } => {
            for (name, value) in extra {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| GatewayError::internal(format!("upstream header: {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| GatewayError::internal(format!("upstream header: {e}")))?;
                headers.insert(name, value);
            }
        }
    }
    Ok(headers)
}

/// Build the REST request for a tool invocation: substitute `{param}` path
/// placeholders and route remaining args per the query/header mappings.
fn rest_request_from_args(
    rest: &mcpgate_core::dao::RestIntegration,
    args: &Value,
) -> GatewayResult<PassthroughRequest> {
    let empty = serde_json::Map::new();
    let args_map = args.as_object().unwrap_or(&empty);

    let mut path = rest.path_template.clone();
    for (key, value) in args_map {
        let placeholder = format!("{{{key}}}");
        if path.contains(&placeholder) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            path = path.replace(&placeholder, &rendered);
        }
    }
    if path.contains('{') {
        return Err(GatewayError::invalid_request(format!(
            "unresolved path parameters in '{path}'"
        )));
    }

    let mut query = Vec::new();
    for (arg, param) in &rest.query_mapping {
        if let Some(value) = args_map.get(arg) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            query.push((param.clone(), rendered));
        }
    }

    let mut headers = HeaderMap::new();
    for (arg, header) in &rest.header_mapping {
        if let Some(value) = args_map.get(arg).and_then(Value::as_str) {
            let name = HeaderName::from_bytes(header.as_bytes())
                .map_err(|e| GatewayError::invalid_request(format!("bad header mapping: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::invalid_request(format!("bad header value: {e}")))?;
            headers.insert(name, value);
        }
    }

    let body = args_map
        .get("body")
        .map(|b| match b {
            Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            other => Bytes::from(other.to_string()),
        })
        .unwrap_or_default();

    Ok(PassthroughRequest {
        method: rest.method.clone(),
        path: path.trim_start_matches('/').to_string(),
        query,
        headers,
        body,
    })
}

fn render_template(template: &str, args: &Value) -> String {
    let mut rendered = template.to_string();
    if let Some(map) = args.as_object() {
        for (key, value) in map {
            let placeholder = format!("{{{key}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &replacement);
        }
    }
    rendered
}

#[async_trait]
impl RpcHandler for Dispatcher {
    async fn handle(&self, request: JsonRpcRequest, scope: RequestScope) -> JsonRpcResponse {
        let request_id = request.id.as_key();
        let params = request.params.clone().unwrap_or_else(|| json!({}));

        let result: GatewayResult<Value> = match request.method.as_str() {
            methods::INITIALIZE => Ok(json!({
                "protocolVersion": methods::PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": false},
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {"name": "mcpgate", "version": env!("CARGO_PKG_VERSION")},
            })),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let page: Page = serde_json::from_value(params).unwrap_or_default();
                self.catalog
                    .list_tools(&scope.user, page)
                    .await
                    .map(|tools| json!({"tools": tools}))
            }
            methods::TOOLS_CALL => match params.get("name").and_then(Value::as_str) {
                Some(name) => {
                    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                    self.invoke_tool(name, args, &scope, &request_id)
                        .await
                        .map(wrap_tool_result)
                }
                None => Err(GatewayError::invalid_request("tools/call requires 'name'")),
            },
            methods::RESOURCES_LIST => {
                let page: Page = serde_json::from_value(params).unwrap_or_default();
                self.catalog
                    .list_resources(&scope.user, page)
                    .await
                    .map(|resources| json!({"resources": resources}))
            }
            methods::RESOURCES_READ => match params.get("uri").and_then(Value::as_str) {
                Some(uri) => {
                    self.read_resource(uri, params.clone(), &scope, &request_id)
                        .await
                }
                None => Err(GatewayError::invalid_request("resources/read requires 'uri'")),
            },
            methods::PROMPTS_LIST => {
                let page: Page = serde_json::from_value(params).unwrap_or_default();
                self.catalog
                    .list_prompts(&scope.user, page)
                    .await
                    .map(|prompts| json!({"prompts": prompts}))
            }
            methods::PROMPTS_GET => match params.get("name").and_then(Value::as_str) {
                Some(name) => {
                    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                    self.get_prompt(name, args, &scope, &request_id).await
                }
                None => Err(GatewayError::invalid_request("prompts/get requires 'name'")),
            },
            other => {
                warn!(method = other, "unknown method");
                return JsonRpcResponse::error(
                    request.id,
                    mcpgate_protocol::JsonRpcError::new(-32601, "Method not found"),
                );
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(err) => JsonRpcResponse::error(request.id, err.to_rpc_error()),
        }
    }

    async fn on_disconnect(&self, session_id: &str) {
        self.cancellations
            .cancel_session_runs(session_id, "client disconnect")
            .await;
    }
}

impl Dispatcher {
    async fn gateway(&self, gateway_id: &str) -> GatewayResult<GatewayRecord> {
        let gateway = self
            .dao
            .get_gateway(gateway_id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("gateway '{gateway_id}'")))?;
        if !gateway.enabled {
            return Err(GatewayError::unavailable(format!(
                "gateway '{gateway_id}' is disabled"
            )));
        }
        Ok(gateway)
    }
}

/// Wrap a raw upstream result into MCP `tools/call` shape when the upstream
/// did not already produce one.
fn wrap_tool_result(result: Value) -> Value {
    if result.get("content").is_some() {
        return result;
    }
    json!({
        "content": [{"type": "text", "text": result.to_string()}],
        "isError": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_core::dao::RestIntegration;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn rest() -> RestIntegration {
        RestIntegration {
            base_url: "https://api.example.com".into(),
            path_template: "/v1/users/{id}/posts".into(),
            method: "GET".into(),
            query_mapping: HashMap::from([("limit".to_string(), "max".to_string())]),
            header_mapping: HashMap::from([("locale".to_string(), "accept-language".to_string())]),
            allowlist: vec!["api.example.com".into()],
            timeout_ms: None,
        }
    }

    #[test]
    fn rest_request_substitutes_path_and_mappings() {
        let request = rest_request_from_args(
            &rest(),
            &json!({"id": "u7", "limit": 5, "locale": "en-US", "body": "{}"}),
        )
        .unwrap();
        assert_eq!(request.path, "v1/users/u7/posts");
        assert_eq!(request.query, vec![("max".to_string(), "5".to_string())]);
        assert_eq!(request.headers.get("accept-language").unwrap(), "en-US");
        assert_eq!(request.body.as_ref(), b"{}");
    }

    #[test]
    fn unresolved_path_params_fail() {
        let err = rest_request_from_args(&rest(), &json!({"limit": 5})).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[test]
    fn template_rendering_replaces_placeholders() {
        assert_eq!(
            render_template("Hello {name}, you have {n} tasks", &json!({"name": "Ada", "n": 3})),
            "Hello Ada, you have 3 tasks"
        );
    }

    #[test]
    fn tool_results_are_wrapped_once() {
        let wrapped = wrap_tool_result(json!({"x": 1}));
        assert_eq!(wrapped["content"][0]["type"], "text");
        let already = json!({"content": [{"type": "text", "text": "hi"}]});
        assert_eq!(wrap_tool_result(already.clone()), already);
    }
}
