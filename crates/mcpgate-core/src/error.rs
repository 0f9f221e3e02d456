//! Gateway error types and handling
//!
//! One taxonomy crosses every layer: transports, the session pool, federation
//! dispatch, plugins, and the sandbox all speak `GatewayError`. The edge maps
//! each variant to a JSON-RPC error object or an HTTP status.

use mcpgate_protocol::JsonRpcError;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Severity attached to a plugin violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Informational finding
    Info,
    /// Suspicious but tolerable
    Warning,
    /// Must block in enforce mode
    Error,
}

/// Comprehensive gateway error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No credential present and anonymous access is disabled
    #[error("Authentication required")]
    AuthRequired,

    /// Credential present but malformed, expired, or failing verification
    #[error("Authentication invalid: {message}")]
    AuthInvalid {
        /// Error message
        message: String,
        /// Authentication method that failed
        method: Option<String>,
    },

    /// Entity or run missing
    #[error("Not found: {resource}")]
    NotFound {
        /// Resource that was not found
        resource: String,
    },

    /// Visibility/team scope denies access, or passthrough disabled
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Error message
        message: String,
    },

    /// A plugin blocked the request in enforce mode
    #[error("Policy violation by plugin '{plugin}': {reason}")]
    PolicyViolation {
        /// Name of the plugin that raised the violation
        plugin: String,
        /// Violation severity
        severity: ViolationSeverity,
        /// Human-readable reason
        reason: String,
    },

    /// Passthrough target resolved to a refused address
    #[error("SSRF blocked: {message}")]
    SsrfBlocked {
        /// Error message (never includes the allowlist)
        message: String,
    },

    /// Passthrough host not present in the tool allowlist
    #[error("Host not in allowlist")]
    AllowlistViolation,

    /// Passthrough request or response body over the configured cap
    #[error("Payload too large: {actual} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Observed size
        actual: usize,
        /// Configured cap
        limit: usize,
    },

    /// Upstream unreachable: DNS failure, connection refused, or lost owner
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable {
        /// Error message
        message: String,
    },

    /// Upstream call or pool operation timed out
    #[error("Upstream timeout: {operation} timed out after {timeout_ms}ms")]
    UpstreamTimeout {
        /// Operation that timed out
        operation: String,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Upstream answered with an error
    #[error("Upstream error: {message}")]
    UpstreamError {
        /// Error message
        message: String,
        /// HTTP status from the upstream, when one exists
        status: Option<u16>,
    },

    /// Circuit breaker is open for the target URL
    #[error("Circuit open for {url}")]
    CircuitOpen {
        /// Target URL whose breaker is open
        url: String,
    },

    /// Pool saturated: no session released within the acquire window
    #[error("Pool acquire timed out after {timeout_ms}ms")]
    AcquireTimeout {
        /// Acquire timeout in milliseconds
        timeout_ms: u64,
    },

    /// Run was cancelled locally or via the cluster channel
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason
        reason: String,
    },

    /// Malformed client input
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message
        message: String,
    },

    /// Unexpected internal failure; logged with full detail, opaque externally
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create an auth-invalid error
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::AuthInvalid {
            message: message.into(),
            method: None,
        }
    }

    /// Create an auth-invalid error recording the failing method
    pub fn auth_invalid_with_method(
        message: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self::AuthInvalid {
            message: message.into(),
            method: Some(method.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create an upstream-unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
        }
    }

    /// Create an upstream-timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::UpstreamTimeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an upstream error without a status code
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamError {
            message: message.into(),
            status: None,
        }
    }

    /// Create an upstream error mirroring an HTTP status
    pub fn upstream_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::UpstreamError {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an invalid-request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a single idempotent retry is permitted for this failure.
    ///
    /// Timeouts are never retried: the upstream may have started work.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    /// JSON-RPC error code for responses at the RPC edge.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            Self::AuthRequired => -32001,
            Self::AuthInvalid { .. } => -32002,
            Self::NotFound { .. } => -32004,
            Self::Forbidden { .. } => -32005,
            Self::PolicyViolation { .. } => -32006,
            Self::SsrfBlocked { .. } | Self::AllowlistViolation => -32007,
            Self::PayloadTooLarge { .. } => -32011,
            Self::UpstreamUnavailable { .. } => -32012,
            Self::UpstreamTimeout { .. } => -32013,
            Self::UpstreamError { .. } => -32014,
            Self::CircuitOpen { .. } => -32015,
            Self::AcquireTimeout { .. } => -32016,
            Self::Cancelled { .. } => -32017,
            Self::InvalidRequest { .. } => -32600,
            Self::Internal(_) => -32603,
        }
    }

    /// HTTP status for responses at the REST edge.
    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::AuthRequired | Self::AuthInvalid { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Forbidden { .. } | Self::SsrfBlocked { .. } | Self::AllowlistViolation => {
                StatusCode::FORBIDDEN
            }
            Self::PolicyViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnavailable { .. } | Self::CircuitOpen { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } | Self::AcquireTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::UpstreamError { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Cancelled { .. } => StatusCode::OK,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Externally visible JSON-RPC error object.
    ///
    /// Internal errors are reported opaquely; everything the caller may act
    /// on (plugin name, upstream status, retry windows) rides in `data`.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let mut err = match self {
            Self::Internal(_) => JsonRpcError::new(self.error_code(), "internal_error"),
            other => JsonRpcError::new(other.error_code(), other.to_string()),
        };
        if let Self::PolicyViolation {
            plugin,
            severity,
            reason,
        } = self
        {
            err = err.with_data(serde_json::json!({
                "plugin": plugin,
                "severity": severity,
                "reason": reason,
            }));
        }
        if let Self::UpstreamError {
            status: Some(status),
            ..
        } = self
        {
            err = err.with_data(serde_json::json!({ "status": status }));
        }
        err
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest {
            message: format!("Malformed JSON: {err}"),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("IO error: {err}"))
    }
}
