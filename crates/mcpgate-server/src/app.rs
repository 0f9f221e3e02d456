//! Application wiring
//!
//! Every component is constructed once here and passed explicitly into the
//! handlers through [`AppContext`]; there is no process-global state. The
//! dispatcher and the sandbox bridge reference each other, so the bridge is
//! a late-bound cell filled after the dispatcher exists.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use mcpgate_core::cache::Cache;
use mcpgate_core::dao::Dao;
use mcpgate_core::{
    Authenticator, GatewayConfig, GatewayError, GatewayResult, MemoryCache, MemoryDao,
    RedisCache, UserContext,
};
use mcpgate_federation::dispatch::CodeExecutor;
use mcpgate_federation::{CancellationService, Dispatcher, Passthrough};
use mcpgate_plugins::{DenyPatternGuard, PiiRedactor, PluginMode, PluginPipeline};
use mcpgate_pool::{PoolAffinity, UpstreamPool};
use mcpgate_sandbox::{CodeExecutionService, ToolBridge};
use mcpgate_transport::{
    ForwardedRpcClient, HttpTransportState, RequestScope, RpcHandler, SessionRegistry,
    SessionTransport, WorkerDirectory, spawn_forward_listener,
};

/// Fully wired gateway components for one worker.
pub struct AppContext {
    /// Gateway configuration
    pub config: GatewayConfig,
    /// Cache backend
    pub cache: Arc<dyn Cache>,
    /// Persistence DAO
    pub dao: Arc<dyn Dao>,
    /// Authenticator
    pub authenticator: Authenticator,
    /// Session ownership registry
    pub registry: Arc<SessionRegistry>,
    /// Upstream session pool
    pub pool: Arc<UpstreamPool>,
    /// Pool affinity pins
    pub affinity: PoolAffinity,
    /// Cancellation service
    pub cancellations: Arc<CancellationService>,
    /// Business-logic dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Passthrough executor
    pub passthrough: Arc<Passthrough>,
    /// Code execution service, when enabled
    pub code_exec: Option<Arc<CodeExecutionService>>,
    /// Worker address directory for HTTP RPC forwarding
    pub directory: WorkerDirectory,
    /// HTTP client for worker-to-worker RPC forwarding
    pub peer_client: reqwest::Client,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl AppContext {
    /// Build every component from configuration. `dao` and `cache` are
    /// injectable so tests and embedded deployments can supply their own
    /// store, or share one cache across simulated workers.
    pub async fn build(
        config: GatewayConfig,
        dao: Option<Arc<dyn Dao>>,
        cache: Option<Arc<dyn Cache>>,
    ) -> GatewayResult<Self> {
        let cache: Arc<dyn Cache> = match cache {
            Some(cache) => cache,
            None if config.cache.redis_url.is_empty() => {
                if config.session.affinity_enabled {
                    warn!("no redis configured; session affinity degrades to single-worker mode");
                }
                Arc::new(MemoryCache::new())
            }
            None => Arc::new(RedisCache::connect(&config.cache.redis_url).await?),
        };
        let dao = dao.unwrap_or_else(|| Arc::new(MemoryDao::new()));

        let worker_id = if config.server.worker_id.is_empty() {
            format!("worker-{}", Uuid::new_v4())
        } else {
            config.server.worker_id.clone()
        };
        info!(worker_id = %worker_id, "wiring gateway components");

        let advertise_addr = if config.server.advertise_addr.is_empty() {
            format!("http://{}", config.server.bind_addr)
        } else {
            config.server.advertise_addr.clone()
        };
        let directory = WorkerDirectory::new(
            Arc::clone(&cache),
            worker_id.clone(),
            advertise_addr,
            config.session.ttl(),
        );

        let authenticator = Authenticator::new(config.auth.clone());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&cache),
            worker_id.clone(),
            config.session.ttl(),
        ));
        let pool = Arc::new(UpstreamPool::new(
            config.pool.clone(),
            authenticator.clone(),
        ));
        let affinity = PoolAffinity::new(Arc::clone(&cache), worker_id, config.session.ttl());
        let cancellations = Arc::new(CancellationService::new(
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&dao),
        ));

        let pipeline = Arc::new(build_pipeline(&config)?);
        let passthrough = Arc::new(Passthrough::new(
            config.passthrough.clone(),
            Arc::clone(&dao),
            Arc::clone(&pipeline),
            authenticator.clone(),
        )?);

        // The sandbox bridge needs the dispatcher, which needs the sandbox
        // executor; late-bind the bridge.
        let late_bridge = Arc::new(LateBridge::default());
        let code_exec = if config.code_execution.enabled {
            Some(Arc::new(CodeExecutionService::new(
                config.code_execution.clone(),
                Arc::clone(&cache),
                Arc::clone(&dao),
                Some(Arc::clone(&late_bridge) as Arc<dyn ToolBridge>),
            )))
        } else {
            None
        };
        let executor = code_exec
            .as_ref()
            .map(|service| Arc::new(SandboxExecutor(Arc::clone(service))) as Arc<dyn CodeExecutor>);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&dao),
            pipeline,
            Arc::clone(&pool),
            affinity.clone(),
            Arc::clone(&cancellations),
            authenticator.clone(),
            config.identity_propagation.clone(),
            config.pool.clone(),
            config.passthrough.clone(),
            Arc::clone(&passthrough),
            executor,
        )?);
        late_bridge.bind(Arc::clone(&dispatcher));

        let mut background = Vec::new();
        background.push(cancellations.spawn_cancel_listener());
        background.push(pool.spawn_maintenance());
        background.push(spawn_forward_listener(
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&dispatcher) as Arc<dyn RpcHandler>,
        ));
        background.push(directory.spawn_advertiser());

        let peer_client = reqwest::Client::builder()
            .timeout(config.session.forward_timeout())
            .build()
            .map_err(|e| GatewayError::internal(format!("peer client: {e}")))?;

        Ok(Self {
            config,
            cache,
            dao,
            authenticator,
            registry,
            pool,
            affinity,
            cancellations,
            dispatcher,
            passthrough,
            code_exec,
            directory,
            peer_client,
            background,
        })
    }

    /// Transport-layer state for the shared HTTP routes.
    #[must_use]
    pub fn transport_state(&self) -> HttpTransportState {
        HttpTransportState {
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.dispatcher) as Arc<dyn RpcHandler>,
            forward: ForwardedRpcClient::new(
                Arc::clone(&self.cache),
                self.config.session.forward_timeout(),
            ),
            keepalive: std::time::Duration::from_secs(self.config.session.keepalive_seconds),
            affinity_enabled: self.config.session.affinity_enabled,
        }
    }

    /// Graceful teardown: drain, close the pool, release ownership keys.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        let grace = std::time::Duration::from_secs(self.config.server.shutdown_grace_seconds);
        let deadline = tokio::time::Instant::now() + grace;
        while self.cancellations.active_runs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.pool.close_all();
        self.registry.release_all().await;
        if let Err(e) = self.directory.withdraw().await {
            tracing::warn!(error = %e, "worker address withdrawal failed");
        }
        for task in &self.background {
            task.abort();
        }
    }
}

fn build_pipeline(config: &GatewayConfig) -> GatewayResult<PluginPipeline> {
    let mut pipeline = PluginPipeline::new();
    let plugins = &config.plugins;
    if !plugins.deny_patterns.is_empty() {
        let guard = DenyPatternGuard::new("deny-guard", &plugins.deny_patterns)
            .map_err(|e| GatewayError::internal(format!("deny pattern: {e}")))?;
        pipeline.register(Arc::new(guard), parse_mode(&plugins.deny_mode)?);
    }
    if !plugins.redact_pii_types.is_empty() {
        let redactor = PiiRedactor::new("pii-redactor", &plugins.redact_pii_types);
        pipeline.register(Arc::new(redactor), parse_mode(&plugins.redact_mode)?);
    }
    Ok(pipeline)
}

fn parse_mode(raw: &str) -> GatewayResult<PluginMode> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| GatewayError::internal(format!("unknown plugin mode '{raw}'")))
}

/// Late-bound sandbox → dispatcher bridge.
#[derive(Debug, Default)]
struct LateBridge {
    dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl LateBridge {
    fn bind(&self, dispatcher: Arc<Dispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }
}

#[async_trait]
impl ToolBridge for LateBridge {
    async fn invoke(&self, name: &str, args: Value, user: &UserContext) -> GatewayResult<Value> {
        let dispatcher = self
            .dispatcher
            .get()
            .ok_or_else(|| GatewayError::internal("tool bridge used before wiring completed"))?;
        let scope = RequestScope {
            session_id: format!("sandbox-{}", Uuid::new_v4()),
            transport: SessionTransport::StreamableHttp,
            user: user.clone(),
            headers: http::header::HeaderMap::new(),
        };
        let request_id = format!("bridge-{}", Uuid::new_v4());
        dispatcher.invoke_tool(name, args, &scope, &request_id).await
    }
}

/// Adapter exposing the sandbox service as the dispatcher's code executor.
#[derive(Debug)]
struct SandboxExecutor(Arc<CodeExecutionService>);

#[async_trait]
impl CodeExecutor for SandboxExecutor {
    async fn shell_exec(
        &self,
        server_id: &str,
        user: &UserContext,
        args: Value,
    ) -> GatewayResult<Value> {
        self.0.shell_exec(server_id, user, args).await
    }

    async fn fs_browse(
        &self,
        server_id: &str,
        user: &UserContext,
        args: Value,
    ) -> GatewayResult<Value> {
        self.0.fs_browse(server_id, user, args).await
    }
}
