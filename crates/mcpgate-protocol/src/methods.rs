//! MCP method names the gateway routes on.

/// MCP `initialize` handshake.
pub const INITIALIZE: &str = "initialize";
/// Liveness check, answered locally by the dispatcher.
pub const PING: &str = "ping";
/// List federated tools.
pub const TOOLS_LIST: &str = "tools/list";
/// Invoke a tool.
pub const TOOLS_CALL: &str = "tools/call";
/// List federated resources.
pub const RESOURCES_LIST: &str = "resources/list";
/// Read a resource by URI.
pub const RESOURCES_READ: &str = "resources/read";
/// List federated prompts.
pub const PROMPTS_LIST: &str = "prompts/list";
/// Render a prompt.
pub const PROMPTS_GET: &str = "prompts/get";
/// Server-initiated cancellation notice.
pub const NOTIFICATIONS_CANCELLED: &str = "notifications/cancelled";
/// Client notice that initialization completed.
pub const NOTIFICATIONS_INITIALIZED: &str = "notifications/initialized";

/// Protocol revision this gateway speaks with upstreams.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
