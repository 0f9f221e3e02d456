//! Persistence contract and entity records
//!
//! The gateway reads entity state through this DAO; writes are rare (gateway
//! registration, audit). The core assumes read-committed semantics and
//! tolerates stale reads between refreshes. An in-memory implementation backs
//! tests and single-node evaluation; production wires a database behind the
//! same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::identity::IdentityPropagation;

/// Entity visibility scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to every caller
    Public,
    /// Visible to the owning team
    #[default]
    Team,
    /// Visible to the owning user only
    Private,
}

/// Transport an upstream gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Server-sent events
    Sse,
    /// Streamable HTTP
    StreamableHttp,
    /// Child-process stdio
    Stdio,
}

impl TransportKind {
    /// Wire name used in pool keys and config.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
            Self::Stdio => "stdio",
        }
    }
}

/// How the gateway authenticates to an upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamAuth {
    /// No upstream credential
    #[default]
    None,
    /// Static bearer token
    Bearer {
        /// Token value
        token: String,
    },
    /// Basic credentials
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Arbitrary static headers
    Headers {
        /// Header name → value
        headers: HashMap<String, String>,
    },
}

/// A registered upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    /// Stable opaque id
    pub id: String,
    /// Upstream URL (or command line for stdio)
    pub url: String,
    /// Transport the upstream speaks
    pub transport: TransportKind,
    /// Upstream credential
    #[serde(default)]
    pub auth: UpstreamAuth,
    /// Identity propagation override; falls back to the global config
    #[serde(default)]
    pub identity_propagation: Option<IdentityPropagation>,
    /// Owning team
    pub team_id: Option<String>,
    /// Visibility scope
    #[serde(default)]
    pub visibility: Visibility,
    /// Administratively enabled
    pub enabled: bool,
    /// Last health observation
    #[serde(default)]
    pub reachable: bool,
    /// Last successful contact
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// REST passthrough integration fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestIntegration {
    /// Base URL joined with the path template
    pub base_url: String,
    /// Path template with `{param}` placeholders
    pub path_template: String,
    /// HTTP method
    pub method: String,
    /// Tool argument → query parameter name
    #[serde(default)]
    pub query_mapping: HashMap<String, String>,
    /// Tool argument → header name
    #[serde(default)]
    pub header_mapping: HashMap<String, String>,
    /// Permitted hosts, exact or `.suffix` patterns
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Per-tool timeout override
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Closed set of integration types a tool can carry (one variant per
/// dispatch path; no runtime extension).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Integration {
    /// Federated MCP tool on the linked gateway
    Mcp {
        /// Name the upstream knows the tool by
        remote_name: String,
    },
    /// REST passthrough
    Rest(RestIntegration),
    /// GraphQL operation
    #[serde(rename = "graphql")]
    GraphQl {
        /// Endpoint URL
        url: String,
        /// Registered operation string
        operation: String,
        /// Tool argument → GraphQL variable name
        #[serde(default)]
        variables_mapping: HashMap<String, String>,
    },
    /// gRPC unary method
    Grpc {
        /// Channel endpoint
        endpoint: String,
        /// Full method path, `/{package.Service}/{Method}`
        method_path: String,
    },
    /// Sandbox meta-tool on a code-execution server
    CodeExecution {
        /// Virtual server the session belongs to
        server_id: String,
    },
}

impl Integration {
    /// Integration type name for logs and audit records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Mcp { .. } => "mcp",
            Self::Rest(_) => "rest",
            Self::GraphQl { .. } => "graphql",
            Self::Grpc { .. } => "grpc",
            Self::CodeExecution { .. } => "code_execution",
        }
    }
}

/// A federated or locally registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    /// Stable opaque id
    pub id: String,
    /// Linked gateway, for MCP tools
    pub gateway_id: Option<String>,
    /// Owning team
    pub team_id: Option<String>,
    /// Owning user; gates `private` visibility
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Name unique per `(team_id, gateway_id)`
    pub name: String,
    /// Dispatch target
    pub integration: Integration,
    /// JSON schema of the arguments
    #[serde(default)]
    pub schema: Value,
    /// Free-form tags, used by mount rules
    #[serde(default)]
    pub tags: Vec<String>,
    /// Visibility scope
    #[serde(default)]
    pub visibility: Visibility,
    /// Administratively enabled
    pub enabled: bool,
    /// Pre-invoke plugin chain override
    #[serde(default)]
    pub plugin_pre_chain: Vec<String>,
    /// Post-invoke plugin chain override
    #[serde(default)]
    pub plugin_post_chain: Vec<String>,
}

/// A federated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Stable opaque id
    pub id: String,
    /// Linked gateway
    pub gateway_id: Option<String>,
    /// Owning team
    pub team_id: Option<String>,
    /// Owning user; gates `private` visibility
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Name unique per `(team_id, gateway_id)`
    pub name: String,
    /// Resource URI
    pub uri: String,
    /// Inline content for locally registered resources; remote resources
    /// read through their gateway
    #[serde(default)]
    pub content: Option<String>,
    /// Visibility scope
    #[serde(default)]
    pub visibility: Visibility,
    /// Administratively enabled
    pub enabled: bool,
    /// Pre-fetch plugin chain override
    #[serde(default)]
    pub plugin_pre_chain: Vec<String>,
    /// Post-fetch plugin chain override
    #[serde(default)]
    pub plugin_post_chain: Vec<String>,
}

/// A federated prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    /// Stable opaque id
    pub id: String,
    /// Linked gateway
    pub gateway_id: Option<String>,
    /// Owning team
    pub team_id: Option<String>,
    /// Owning user; gates `private` visibility
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Name unique per `(team_id, gateway_id)`
    pub name: String,
    /// Local template; remote prompts render upstream
    #[serde(default)]
    pub template: Option<String>,
    /// Visibility scope
    #[serde(default)]
    pub visibility: Visibility,
    /// Administratively enabled
    pub enabled: bool,
    /// Pre-fetch plugin chain override
    #[serde(default)]
    pub plugin_pre_chain: Vec<String>,
    /// Post-fetch plugin chain override
    #[serde(default)]
    pub plugin_post_chain: Vec<String>,
}

/// Virtual server kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    /// Plain curated bundle
    #[default]
    Standard,
    /// Sandbox-backed code execution server
    CodeExecution,
}

/// Tool-call permissions inside the sandbox bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallPermissions {
    /// Glob patterns of callable tool names; empty allows all
    #[serde(default)]
    pub allow: Vec<String>,
    /// Glob patterns of denied tool names; evaluated after allow
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Resource limits and egress policy for sandboxed code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// CPU seconds
    pub cpu_seconds: u64,
    /// Memory cap in bytes
    pub memory_bytes: u64,
    /// Wall-clock cap in seconds
    pub wall_clock_seconds: u64,
    /// Per-file write cap in bytes
    pub max_file_bytes: u64,
    /// Permit direct network egress from sandboxed code
    pub allow_raw_http: bool,
    /// Tool bridge permissions
    pub tool_call_permissions: ToolCallPermissions,
    /// Maximum recursive bridge depth
    pub max_bridge_depth: u32,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            cpu_seconds: 10,
            memory_bytes: 256 * 1024 * 1024,
            wall_clock_seconds: 30,
            max_file_bytes: 8 * 1024 * 1024,
            allow_raw_http: false,
            tool_call_permissions: ToolCallPermissions::default(),
            max_bridge_depth: 3,
        }
    }
}

/// Mount filter for `/tools` and `/skills`, evaluated include-then-exclude.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountRules {
    /// Tags to include; empty includes all
    pub include_tags: Vec<String>,
    /// Tags to exclude
    pub exclude_tags: Vec<String>,
    /// Gateway ids to include; empty includes all
    pub include_servers: Vec<String>,
    /// Gateway ids to exclude
    pub exclude_servers: Vec<String>,
    /// Tool names to include; empty includes all
    pub include_tools: Vec<String>,
    /// Tool names to exclude
    pub exclude_tools: Vec<String>,
}

/// PII tokenization policy for sandbox I/O.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizationPolicy {
    /// Master switch
    pub enabled: bool,
    /// PII categories to tokenize (`email`, `phone`, `ssn`, ...)
    pub pii_types: Vec<String>,
}

/// A curated bundle of tools/resources/prompts, optionally sandbox-backed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualServerRecord {
    /// Stable opaque id
    pub id: String,
    /// Display name
    pub name: String,
    /// Server kind
    #[serde(default)]
    pub server_type: ServerType,
    /// Sandbox limits, for code-execution servers
    #[serde(default)]
    pub sandbox_policy: SandboxPolicy,
    /// Mount filter
    #[serde(default)]
    pub mount_rules: MountRules,
    /// Tokenization policy
    #[serde(default)]
    pub tokenization: TokenizationPolicy,
    /// `team:<id>` or `user:<email>` skills scope
    #[serde(default)]
    pub skills_scope: Option<String>,
    /// Only approved skills mount
    #[serde(default)]
    pub skills_require_approval: bool,
    /// Curated tool ids
    #[serde(default)]
    pub associated_tool_ids: Vec<String>,
    /// Curated resource ids
    #[serde(default)]
    pub associated_resource_ids: Vec<String>,
    /// Curated prompt ids
    #[serde(default)]
    pub associated_prompt_ids: Vec<String>,
}

/// One audit entry; sensitive header values are redacted before this record
/// is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id
    pub id: String,
    /// How the caller authenticated
    pub auth_method: String,
    /// Impersonation target, when delegation is in play
    pub acting_as: Option<String>,
    /// Delegation chain, oldest first
    #[serde(default)]
    pub delegation_chain: Vec<String>,
    /// Operation name
    pub operation: String,
    /// Outcome (`ok`, `denied`, `error:...`)
    pub outcome: String,
    /// Redacted operation detail
    #[serde(default)]
    pub detail: Value,
    /// When the operation happened
    pub timestamp: DateTime<Utc>,
}

/// Synchronous-CRUD persistence contract consumed by the core.
#[async_trait]
pub trait Dao: Send + Sync + std::fmt::Debug {
    /// All gateway records.
    async fn list_gateways(&self) -> GatewayResult<Vec<GatewayRecord>>;
    /// One gateway by id.
    async fn get_gateway(&self, id: &str) -> GatewayResult<Option<GatewayRecord>>;
    /// Insert or replace a gateway. `(url, transport)` must stay unique per
    /// team scope.
    async fn upsert_gateway(&self, record: GatewayRecord) -> GatewayResult<()>;
    /// Delete a gateway, cascading into linked tools/resources/prompts.
    async fn delete_gateway(&self, id: &str) -> GatewayResult<()>;

    /// All tool records.
    async fn list_tools(&self) -> GatewayResult<Vec<ToolRecord>>;
    /// One tool by id.
    async fn get_tool(&self, id: &str) -> GatewayResult<Option<ToolRecord>>;
    /// Insert or replace a tool.
    async fn upsert_tool(&self, record: ToolRecord) -> GatewayResult<()>;
    /// Delete a tool.
    async fn delete_tool(&self, id: &str) -> GatewayResult<()>;

    /// All resource records.
    async fn list_resources(&self) -> GatewayResult<Vec<ResourceRecord>>;
    /// Insert or replace a resource.
    async fn upsert_resource(&self, record: ResourceRecord) -> GatewayResult<()>;

    /// All prompt records.
    async fn list_prompts(&self) -> GatewayResult<Vec<PromptRecord>>;
    /// Insert or replace a prompt.
    async fn upsert_prompt(&self, record: PromptRecord) -> GatewayResult<()>;

    /// One virtual server by id.
    async fn get_virtual_server(&self, id: &str) -> GatewayResult<Option<VirtualServerRecord>>;
    /// Insert or replace a virtual server.
    async fn upsert_virtual_server(&self, record: VirtualServerRecord) -> GatewayResult<()>;

    /// Append an audit record.
    async fn record_audit(&self, record: AuditRecord) -> GatewayResult<()>;
}

/// In-memory DAO for tests and single-node evaluation.
#[derive(Debug, Default)]
pub struct MemoryDao {
    gateways: DashMap<String, GatewayRecord>,
    tools: DashMap<String, ToolRecord>,
    resources: DashMap<String, ResourceRecord>,
    prompts: DashMap<String, PromptRecord>,
    servers: DashMap<String, VirtualServerRecord>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryDao {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded audit entries, for assertions in tests.
    #[must_use]
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }
}

#[async_trait]
impl Dao for MemoryDao {
    async fn list_gateways(&self) -> GatewayResult<Vec<GatewayRecord>> {
        Ok(self.gateways.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_gateway(&self, id: &str) -> GatewayResult<Option<GatewayRecord>> {
        Ok(self.gateways.get(id).map(|e| e.value().clone()))
    }

    async fn upsert_gateway(&self, record: GatewayRecord) -> GatewayResult<()> {
        let duplicate = self.gateways.iter().any(|e| {
            e.id != record.id
                && e.url == record.url
                && e.transport == record.transport
                && e.team_id == record.team_id
        });
        if duplicate {
            return Err(GatewayError::invalid_request(format!(
                "gateway with url '{}' and transport '{}' already registered for this team",
                record.url,
                record.transport.as_str()
            )));
        }
        self.gateways.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_gateway(&self, id: &str) -> GatewayResult<()> {
        self.gateways.remove(id);
        self.tools.retain(|_, t| t.gateway_id.as_deref() != Some(id));
        self.resources
            .retain(|_, r| r.gateway_id.as_deref() != Some(id));
        self.prompts
            .retain(|_, p| p.gateway_id.as_deref() != Some(id));
        Ok(())
    }

    async fn list_tools(&self) -> GatewayResult<Vec<ToolRecord>> {
        Ok(self.tools.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_tool(&self, id: &str) -> GatewayResult<Option<ToolRecord>> {
        Ok(self.tools.get(id).map(|e| e.value().clone()))
    }

    async fn upsert_tool(&self, record: ToolRecord) -> GatewayResult<()> {
        self.tools.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_tool(&self, id: &str) -> GatewayResult<()> {
        self.tools.remove(id);
        Ok(())
    }

    async fn list_resources(&self) -> GatewayResult<Vec<ResourceRecord>> {
        Ok(self.resources.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert_resource(&self, record: ResourceRecord) -> GatewayResult<()> {
        self.resources.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list_prompts(&self) -> GatewayResult<Vec<PromptRecord>> {
        Ok(self.prompts.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert_prompt(&self, record: PromptRecord) -> GatewayResult<()> {
        self.prompts.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_virtual_server(&self, id: &str) -> GatewayResult<Option<VirtualServerRecord>> {
        Ok(self.servers.get(id).map(|e| e.value().clone()))
    }

    async fn upsert_virtual_server(&self, record: VirtualServerRecord) -> GatewayResult<()> {
        self.servers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn record_audit(&self, record: AuditRecord) -> GatewayResult<()> {
        self.audit.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(id: &str, url: &str) -> GatewayRecord {
        GatewayRecord {
            id: id.into(),
            url: url.into(),
            transport: TransportKind::StreamableHttp,
            auth: UpstreamAuth::None,
            identity_propagation: None,
            team_id: Some("eng".into()),
            visibility: Visibility::Team,
            enabled: true,
            reachable: false,
            last_seen: None,
        }
    }

    fn tool(id: &str, gateway_id: &str) -> ToolRecord {
        ToolRecord {
            id: id.into(),
            gateway_id: Some(gateway_id.into()),
            team_id: Some("eng".into()),
            owner_id: None,
            name: format!("tool-{id}"),
            integration: Integration::Mcp {
                remote_name: format!("tool-{id}"),
            },
            schema: Value::Null,
            tags: Vec::new(),
            visibility: Visibility::Team,
            enabled: true,
            plugin_pre_chain: Vec::new(),
            plugin_post_chain: Vec::new(),
        }
    }

    #[tokio::test]
    async fn gateway_url_transport_unique_per_team() {
        let dao = MemoryDao::new();
        dao.upsert_gateway(gateway("g1", "http://up.example"))
            .await
            .unwrap();
        let err = dao
            .upsert_gateway(gateway("g2", "http://up.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn deleting_gateway_cascades_into_tools() {
        let dao = MemoryDao::new();
        dao.upsert_gateway(gateway("g1", "http://up.example"))
            .await
            .unwrap();
        dao.upsert_tool(tool("t1", "g1")).await.unwrap();
        dao.upsert_tool(tool("t2", "g1")).await.unwrap();

        dao.delete_gateway("g1").await.unwrap();
        assert!(dao.list_tools().await.unwrap().is_empty());
    }

    #[test]
    fn integration_serde_tags_by_type() {
        let mcp: Integration =
            serde_json::from_value(serde_json::json!({"type": "mcp", "remote_name": "echo"}))
                .unwrap();
        assert_eq!(mcp.kind(), "mcp");

        let rest: Integration = serde_json::from_value(serde_json::json!({
            "type": "rest",
            "base_url": "https://api.example.com",
            "path_template": "/v1/{id}",
            "method": "GET",
        }))
        .unwrap();
        assert_eq!(rest.kind(), "rest");
    }
}
