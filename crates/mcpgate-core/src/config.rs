//! Gateway configuration
//!
//! Defaulted serde structs loadable from a TOML/JSON file with `MCPGATE_*`
//! environment overrides. Every timeout in the concurrency model lives here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::{AuthConfig, IdentityPropagation};

/// Default logical session TTL.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 300;

/// Default pool acquire / transport / create timeout.
pub const DEFAULT_POOL_TIMEOUT_SECS: u64 = 30;

/// Default forwarded-RPC deadline across workers.
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 30;

/// Default health probe bound.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Default code-execution session TTL.
pub const DEFAULT_CODE_EXEC_TTL_SECS: u64 = 900;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listener settings
    pub server: ServerSettings,
    /// Authentication settings
    pub auth: AuthConfig,
    /// Default identity propagation, overridable per gateway record
    pub identity_propagation: IdentityPropagation,
    /// Logical session settings
    pub session: SessionSettings,
    /// Upstream session pool settings
    pub pool: PoolSettings,
    /// REST passthrough settings
    pub passthrough: PassthroughSettings,
    /// Code execution settings
    pub code_execution: CodeExecutionSettings,
    /// Cache backend settings
    pub cache: CacheSettings,
    /// Built-in plugin settings
    pub plugins: PluginSettings,
}

impl GatewayConfig {
    /// Load configuration from an optional file plus `MCPGATE_*` environment
    /// overrides (`MCPGATE_POOL__MAX_PER_KEY=4` style nesting).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(config::Environment::with_prefix("MCPGATE").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub bind_addr: String,
    /// HTTP base URL other workers reach this worker at; derived from
    /// `bind_addr` when empty
    pub advertise_addr: String,
    /// Path prefix for every route
    pub root_path: String,
    /// Stable worker identifier; generated when empty
    pub worker_id: String,
    /// Grace period for draining in-flight runs on shutdown
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            advertise_addr: String::new(),
            root_path: String::new(),
            worker_id: String::new(),
            shutdown_grace_seconds: 10,
        }
    }
}

/// Logical session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Session TTL in the cache, refreshed on activity
    pub ttl_seconds: u64,
    /// Required true for multi-worker deployments
    pub affinity_enabled: bool,
    /// Deadline for forwarded RPCs between workers
    pub forward_timeout_seconds: u64,
    /// SSE keep-alive comment interval
    pub keepalive_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_SESSION_TTL_SECS,
            affinity_enabled: true,
            forward_timeout_seconds: DEFAULT_FORWARD_TIMEOUT_SECS,
            keepalive_seconds: 15,
        }
    }
}

impl SessionSettings {
    /// Session TTL as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Forwarded-RPC deadline as a duration.
    #[must_use]
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_seconds)
    }
}

/// Upstream session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Sessions per `(url, identity, transport)` key
    pub max_per_key: usize,
    /// Wait bound when the key is saturated
    pub acquire_timeout_seconds: u64,
    /// Connect/read/write bound on pooled transports
    pub transport_timeout_seconds: u64,
    /// Bound on session creation including `initialize`
    pub create_timeout_seconds: u64,
    /// Session lifetime before close-on-release
    pub ttl_seconds: u64,
    /// Idle age that triggers a health probe before reuse
    pub health_check_interval_seconds: u64,
    /// Health probe bound
    pub health_check_timeout_seconds: u64,
    /// Age at which empty pool keys are evicted
    pub idle_pool_eviction_seconds: u64,
    /// Consecutive creation failures that open the circuit
    pub circuit_threshold: u32,
    /// Seconds the circuit stays open before a half-open trial
    pub circuit_reset_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_per_key: 4,
            acquire_timeout_seconds: DEFAULT_POOL_TIMEOUT_SECS,
            transport_timeout_seconds: DEFAULT_POOL_TIMEOUT_SECS,
            create_timeout_seconds: DEFAULT_POOL_TIMEOUT_SECS,
            ttl_seconds: 3600,
            health_check_interval_seconds: 60,
            health_check_timeout_seconds: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
            idle_pool_eviction_seconds: 600,
            circuit_threshold: 5,
            circuit_reset_seconds: 60,
        }
    }
}

impl PoolSettings {
    /// Acquire wait bound as a duration.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    /// Pooled transport timeout as a duration.
    #[must_use]
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_seconds)
    }

    /// Session creation bound as a duration.
    #[must_use]
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_seconds)
    }

    /// Session lifetime as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Idle age before a reuse health probe, as a duration.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    /// Health probe bound as a duration.
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }
}

/// SSRF guard settings for REST passthrough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsrfSettings {
    /// Refuse private/link-local/loopback ranges
    pub block_private_ranges: bool,
    /// Hosts exempt from the private-range refusal
    pub private_range_exceptions: Vec<String>,
}

impl Default for SsrfSettings {
    fn default() -> Self {
        Self {
            block_private_ranges: true,
            private_range_exceptions: Vec::new(),
        }
    }
}

/// REST passthrough settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughSettings {
    /// Expose `/passthrough/...` routes at all
    pub expose_passthrough: bool,
    /// Default upstream timeout
    pub default_timeout_ms: u64,
    /// Request body cap in bytes
    pub max_request_bytes: usize,
    /// Response body cap in bytes
    pub max_response_bytes: usize,
    /// SSRF guard
    pub ssrf_protection: SsrfSettings,
    /// Default pre-hook plugin chain names
    pub default_pre_chain: Vec<String>,
    /// Default post-hook plugin chain names
    pub default_post_chain: Vec<String>,
}

impl Default for PassthroughSettings {
    fn default() -> Self {
        Self {
            expose_passthrough: false,
            default_timeout_ms: 30_000,
            max_request_bytes: 10 * 1024 * 1024,
            max_response_bytes: 50 * 1024 * 1024,
            ssrf_protection: SsrfSettings::default(),
            default_pre_chain: Vec::new(),
            default_post_chain: Vec::new(),
        }
    }
}

/// Code execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeExecutionSettings {
    /// Master switch for code-execution servers
    pub enabled: bool,
    /// Shared volume mounted identically on every worker
    pub base_dir: String,
    /// Session registry TTL
    pub session_ttl_seconds: u64,
    /// Allow the `shell_exec` meta-tool
    pub shell_exec_enabled: bool,
    /// Allow the `fs_browse` meta-tool
    pub fs_browse_enabled: bool,
    /// Wait bound on the session lockfile
    pub lock_wait_seconds: u64,
}

impl Default for CodeExecutionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_dir: "/var/lib/mcpgate/sessions".to_string(),
            session_ttl_seconds: DEFAULT_CODE_EXEC_TTL_SECS,
            shell_exec_enabled: true,
            fs_browse_enabled: true,
            lock_wait_seconds: 10,
        }
    }
}

/// Built-in plugin settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Regex patterns blocked on pre hooks; empty disables the guard
    pub deny_patterns: Vec<String>,
    /// Violation mode for the deny guard
    pub deny_mode: String,
    /// PII categories redacted on post hooks; empty disables the redactor
    pub redact_pii_types: Vec<String>,
    /// Violation mode for the redactor
    pub redact_mode: String,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            deny_patterns: Vec::new(),
            deny_mode: "enforce".to_string(),
            redact_pii_types: Vec::new(),
            redact_mode: "permissive".to_string(),
        }
    }
}

/// Cache backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Redis connection string; empty selects the in-memory shim
    pub redis_url: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
        }
    }
}
