//! REST passthrough with SSRF guards
//!
//! Exposes registered REST upstreams through the gateway with the plugin
//! pipeline applied. Every resolved URL is normalized, allowlist-checked,
//! and refused when it lands in a private address range. Audit records carry
//! only redacted header material.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use mcpgate_core::config::PassthroughSettings;
use mcpgate_core::dao::{AuditRecord, Dao, RestIntegration, ToolRecord};
use mcpgate_core::{Authenticator, GatewayError, GatewayResult, UserContext};
use mcpgate_plugins::{Hook, HookPayload, PluginContext, PluginPipeline};

/// Headers never forwarded upstream and always redacted in audit records.
const SENSITIVE_HEADERS: [&str; 4] = ["authorization", "x-api-key", "cookie", "set-cookie"];

/// Headers owned by the HTTP layer, not forwarded.
const HOP_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "upgrade",
];

/// An inbound passthrough call.
#[derive(Debug)]
pub struct PassthroughRequest {
    /// HTTP method
    pub method: String,
    /// Path suffix below the tool mount
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Client headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// The upstream's answer.
#[derive(Debug)]
pub struct PassthroughResponse {
    /// Upstream status (guaranteed < 500; 5xx becomes `UpstreamError`)
    pub status: u16,
    /// Upstream headers
    pub headers: HeaderMap,
    /// Upstream body
    pub body: Bytes,
    /// Wall-clock duration
    pub duration_ms: u64,
}

/// Passthrough executor.
pub struct Passthrough {
    settings: PassthroughSettings,
    dao: Arc<dyn Dao>,
    pipeline: Arc<PluginPipeline>,
    authenticator: Authenticator,
    client: reqwest::Client,
}

impl std::fmt::Debug for Passthrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passthrough").finish_non_exhaustive()
    }
}

impl Passthrough {
    /// Executor with the configured guards.
    pub fn new(
        settings: PassthroughSettings,
        dao: Arc<dyn Dao>,
        pipeline: Arc<PluginPipeline>,
        authenticator: Authenticator,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::internal(format!("passthrough client: {e}")))?;
        Ok(Self {
            settings,
            dao,
            pipeline,
            authenticator,
            client,
        })
    }

    /// Execute a passthrough call for `tool` under `namespace`.
    pub async fn execute(
        &self,
        namespace: &str,
        tool: &ToolRecord,
        rest: &RestIntegration,
        request: PassthroughRequest,
        user: &UserContext,
    ) -> GatewayResult<PassthroughResponse> {
        let outcome = self
            .execute_inner(namespace, tool, rest, request, user)
            .await;
        self.audit(namespace, tool, user, &outcome).await;
        outcome
    }

    /// Guards plus the upstream HTTP call, without plugin hooks. Used by the
    /// dispatcher, which runs the tool hook chains itself.
    pub async fn call_upstream(
        &self,
        namespace: &str,
        tool: &ToolRecord,
        rest: &RestIntegration,
        request: PassthroughRequest,
        user: &UserContext,
    ) -> GatewayResult<PassthroughResponse> {
        let outcome = self.call_upstream_inner(namespace, tool, rest, request, user).await;
        self.audit(namespace, tool, user, &outcome).await;
        outcome
    }

    async fn call_upstream_inner(
        &self,
        namespace: &str,
        tool: &ToolRecord,
        rest: &RestIntegration,
        request: PassthroughRequest,
        user: &UserContext,
    ) -> GatewayResult<PassthroughResponse> {
        if request.body.len() > self.settings.max_request_bytes {
            return Err(GatewayError::PayloadTooLarge {
                actual: request.body.len(),
                limit: self.settings.max_request_bytes,
            });
        }
        check_scope(namespace, tool, user)?;

        let target = build_target(&rest.base_url, &request.path)?;
        check_allowlist(&target, &rest.allowlist)?;
        check_private_ranges(&target, &self.settings).await?;

        let mut headers = request.headers.clone();
        self.authenticator.scrub_request_headers(&mut headers);
        for name in HOP_HEADERS.iter().chain(SENSITIVE_HEADERS.iter()) {
            headers.remove(*name);
        }

        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| GatewayError::invalid_request("bad HTTP method"))?;
        let timeout =
            Duration::from_millis(rest.timeout_ms.unwrap_or(self.settings.default_timeout_ms));

        self.send(method, &target, headers, &request.query, request.body.clone(), timeout)
            .await
    }

    /// The HTTP leg shared by both passthrough paths: bounded request,
    /// capped response, 5xx translated rather than mirrored.
    async fn send(
        &self,
        method: reqwest::Method,
        target: &Url,
        headers: HeaderMap,
        query: &[(String, String)],
        body: impl Into<reqwest::Body>,
        timeout: Duration,
    ) -> GatewayResult<PassthroughResponse> {
        let started = Instant::now();
        let response = self
            .client
            .request(method, target.as_str())
            .headers(headers)
            .query(query)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::timeout("passthrough", timeout.as_millis() as u64)
                } else if e.is_connect() {
                    GatewayError::unavailable(format!("passthrough connect: {e}"))
                } else {
                    GatewayError::upstream(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream(format!("passthrough body: {e}")))?;
        if body.len() > self.settings.max_response_bytes {
            return Err(GatewayError::PayloadTooLarge {
                actual: body.len(),
                limit: self.settings.max_response_bytes,
            });
        }
        // 5xx would blur success/failure semantics if mirrored.
        if status >= 500 {
            return Err(GatewayError::upstream_with_status(
                "passthrough upstream failed",
                status,
            ));
        }

        Ok(PassthroughResponse {
            status,
            headers: response_headers,
            body,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn execute_inner(
        &self,
        namespace: &str,
        tool: &ToolRecord,
        rest: &RestIntegration,
        request: PassthroughRequest,
        user: &UserContext,
    ) -> GatewayResult<PassthroughResponse> {
        if request.body.len() > self.settings.max_request_bytes {
            return Err(GatewayError::PayloadTooLarge {
                actual: request.body.len(),
                limit: self.settings.max_request_bytes,
            });
        }
        check_scope(namespace, tool, user)?;

        let target = build_target(&rest.base_url, &request.path)?;
        check_allowlist(&target, &rest.allowlist)?;
        check_private_ranges(&target, &self.settings).await?;

        let mut headers = request.headers.clone();
        self.authenticator.scrub_request_headers(&mut headers);
        for name in HOP_HEADERS.iter().chain(SENSITIVE_HEADERS.iter()) {
            headers.remove(*name);
        }

        // Pre-hooks see and may rewrite the full call shape.
        let args = json!({
            "method": request.method,
            "url": target.to_string(),
            "headers": headers_to_json(&headers),
            "query_params": request.query.iter().map(|(k, v)| json!([k, v])).collect::<Vec<_>>(),
            "body": String::from_utf8_lossy(&request.body),
        });
        let ctx = PluginContext::new(user.clone());
        let chain = if tool.plugin_pre_chain.is_empty() {
            self.settings.default_pre_chain.clone()
        } else {
            tool.plugin_pre_chain.clone()
        };
        let payload = self
            .pipeline
            .run(
                Hook::ToolPreInvoke,
                HookPayload::tool_pre(&tool.name, args),
                &ctx,
                &chain,
            )
            .await?;
        let args = payload.body().clone();

        let method: reqwest::Method = args["method"]
            .as_str()
            .unwrap_or(&request.method)
            .parse()
            .map_err(|_| GatewayError::invalid_request("bad HTTP method"))?;
        let final_url = args["url"].as_str().unwrap_or_default().to_string();
        // Re-validate after plugin rewrites; a plugin must not be able to
        // steer the call outside the guards.
        let target = normalize_url(&final_url)?;
        check_allowlist(&target, &rest.allowlist)?;
        check_private_ranges(&target, &self.settings).await?;

        let timeout = Duration::from_millis(rest.timeout_ms.unwrap_or(self.settings.default_timeout_ms));
        let body = args["body"].as_str().map(str::to_string).unwrap_or_default();
        let headers = json_to_headers(&args["headers"]).unwrap_or(headers);

        let upstream = self
            .send(method, &target, headers, &request.query, body, timeout)
            .await?;
        let PassthroughResponse {
            status,
            headers: response_headers,
            body,
            duration_ms,
        } = upstream;

        let result = json!({
            "status_code": status,
            "headers": headers_to_json(&response_headers),
            "body": String::from_utf8_lossy(&body),
            "duration_ms": duration_ms,
        });
        let chain = if tool.plugin_post_chain.is_empty() {
            self.settings.default_post_chain.clone()
        } else {
            tool.plugin_post_chain.clone()
        };
        let payload = self
            .pipeline
            .run(
                Hook::ToolPostInvoke,
                HookPayload::tool_post(&tool.name, result),
                &ctx,
                &chain,
            )
            .await?;
        let result = payload.body();
        let final_body = result["body"]
            .as_str()
            .map_or_else(|| body.clone(), |s| Bytes::copy_from_slice(s.as_bytes()));

        debug!(tool = %tool.name, status, duration_ms, "passthrough completed");
        Ok(PassthroughResponse {
            status,
            headers: response_headers,
            body: final_body,
            duration_ms,
        })
    }

    async fn audit(
        &self,
        namespace: &str,
        tool: &ToolRecord,
        user: &UserContext,
        outcome: &GatewayResult<PassthroughResponse>,
    ) {
        let outcome_label = match outcome {
            Ok(response) => format!("ok:{}", response.status),
            Err(err) => format!("error:{}", err.error_code()),
        };
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            auth_method: user.auth_method.as_str().to_string(),
            acting_as: user.service_account.clone(),
            delegation_chain: user.delegation_chain.clone(),
            operation: format!("passthrough:{namespace}:{}", tool.id),
            outcome: outcome_label,
            detail: json!({"tool": tool.name}),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.dao.record_audit(record).await {
            warn!(error = %e, "audit write failed");
        }
    }
}

/// Join the configured base with the request path and normalize.
fn build_target(base_url: &str, path: &str) -> GatewayResult<Url> {
    let joined = if path.is_empty() {
        base_url.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    };
    normalize_url(&joined)
}

/// Parse and normalize a URL: dot segments resolved, duplicate slashes
/// collapsed, scheme restricted to http(s).
pub fn normalize_url(raw: &str) -> GatewayResult<Url> {
    let mut url = Url::parse(raw).map_err(|_| GatewayError::SsrfBlocked {
        message: "unparseable target URL".into(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::SsrfBlocked {
            message: format!("scheme '{}' refused", url.scheme()),
        });
    }
    let collapsed = {
        let path = url.path();
        let mut out = String::with_capacity(path.len());
        let mut prev_slash = false;
        for c in path.chars() {
            if c == '/' {
                if prev_slash {
                    continue;
                }
                prev_slash = true;
            } else {
                prev_slash = false;
            }
            out.push(c);
        }
        out
    };
    url.set_path(&collapsed);
    Ok(url)
}

fn check_allowlist(url: &Url, allowlist: &[String]) -> GatewayResult<()> {
    let Some(host) = url.host_str() else {
        return Err(GatewayError::SsrfBlocked {
            message: "target has no host".into(),
        });
    };
    let host = host.to_ascii_lowercase();
    let allowed = allowlist.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        if let Some(suffix) = entry.strip_prefix('.') {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == entry
        }
    });
    if allowed {
        Ok(())
    } else {
        Err(GatewayError::AllowlistViolation)
    }
}

async fn check_private_ranges(
    url: &Url,
    settings: &PassthroughSettings,
) -> GatewayResult<()> {
    if !settings.ssrf_protection.block_private_ranges {
        return Ok(());
    }
    let Some(host) = url.host_str() else {
        return Err(GatewayError::SsrfBlocked {
            message: "target has no host".into(),
        });
    };
    if settings
        .ssrf_protection
        .private_range_exceptions
        .iter()
        .any(|e| e.eq_ignore_ascii_case(host))
    {
        return Ok(());
    }

    let addrs: Vec<IpAddr> = if let Ok(ip) = host.trim_matches(&['[', ']'][..]).parse::<IpAddr>() {
        vec![ip]
    } else {
        let port = url.port_or_known_default().unwrap_or(80);
        // Resolve now so a hostname pointing into a private range is caught
        // before connect.
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| GatewayError::SsrfBlocked {
                message: "target hostname does not resolve".into(),
            })?
            .map(|sa| sa.ip())
            .collect()
    };

    if addrs.iter().any(|ip| is_private(*ip)) {
        return Err(GatewayError::SsrfBlocked {
            message: "target resolves to a refused address range".into(),
        });
    }
    Ok(())
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || octets[0] == 100 && (64..128).contains(&octets[1])
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private(IpAddr::V4(v4)))
        }
    }
}

fn check_scope(namespace: &str, tool: &ToolRecord, user: &UserContext) -> GatewayResult<()> {
    // Scope gating applies only when the credential carried scopes; the
    // claim is opaque and matched by equality.
    let Some(scopes) = user.attributes.get("passthrough_scopes").and_then(Value::as_array) else {
        return Ok(());
    };
    let required = format!("{namespace}:{}", tool.id);
    if scopes.iter().any(|s| s.as_str() == Some(required.as_str())) {
        Ok(())
    } else {
        Err(GatewayError::forbidden(format!(
            "credential lacks passthrough scope for tool '{}'",
            tool.name
        )))
    }
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            let rendered = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                "[redacted]"
            } else {
                value
            };
            map.insert(name.as_str().to_string(), json!(rendered));
        }
    }
    Value::Object(map)
}

fn json_to_headers(value: &Value) -> Option<HeaderMap> {
    let map = value.as_object()?;
    let mut headers = HeaderMap::new();
    for (name, value) in map {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Some(value) = value.as_str() else { continue };
        if value == "[redacted]" {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rejects_non_http_and_collapses_slashes() {
        assert!(normalize_url("file:///etc/passwd").is_err());
        assert!(normalize_url("gopher://x.example").is_err());
        let url = normalize_url("https://api.example.com//v1///users/../admin").unwrap();
        assert_eq!(url.path(), "/v1/admin");
    }

    #[test]
    fn allowlist_exact_and_suffix() {
        let url = normalize_url("https://api.example.com/x").unwrap();
        assert!(check_allowlist(&url, &["api.example.com".into()]).is_ok());
        assert!(check_allowlist(&url, &[".example.com".into()]).is_ok());
        assert!(matches!(
            check_allowlist(&url, &["other.example.net".into()]).unwrap_err(),
            GatewayError::AllowlistViolation
        ));
        // Empty allowlist blocks everything.
        assert!(check_allowlist(&url, &[]).is_err());
    }

    #[test]
    fn suffix_entries_do_not_match_lookalike_hosts() {
        let url = normalize_url("https://evilexample.com/x").unwrap();
        assert!(check_allowlist(&url, &[".example.com".into()]).is_err());
    }

    #[tokio::test]
    async fn private_ranges_are_refused() {
        let settings = PassthroughSettings::default();
        for target in [
            "http://169.254.169.254/latest/meta-data",
            "http://10.0.0.8/x",
            "http://172.16.4.1/x",
            "http://192.168.1.1/x",
            "http://127.0.0.1/x",
            "http://[::1]/x",
        ] {
            let url = normalize_url(target).unwrap();
            assert!(
                check_private_ranges(&url, &settings).await.is_err(),
                "{target} should be refused"
            );
        }
    }

    #[tokio::test]
    async fn exceptions_bypass_the_private_range_check() {
        let mut settings = PassthroughSettings::default();
        settings
            .ssrf_protection
            .private_range_exceptions
            .push("127.0.0.1".into());
        let url = normalize_url("http://127.0.0.1:8080/x").unwrap();
        assert!(check_private_ranges(&url, &settings).await.is_ok());
    }

    #[test]
    fn sensitive_headers_are_redacted_in_json() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-api-key", HeaderValue::from_static("k-1"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        let rendered = headers_to_json(&headers);
        assert_eq!(rendered["authorization"], "[redacted]");
        assert_eq!(rendered["x-api-key"], "[redacted]");
        assert_eq!(rendered["accept"], "application/json");
    }

    #[test]
    fn scope_gate_matches_by_equality() {
        let tool = ToolRecord {
            id: "tid".into(),
            gateway_id: None,
            team_id: None,
            owner_id: None,
            name: "t".into(),
            integration: mcpgate_core::dao::Integration::Rest(RestIntegration {
                base_url: "https://api.example.com".into(),
                path_template: String::new(),
                method: "GET".into(),
                query_mapping: Default::default(),
                header_mapping: Default::default(),
                allowlist: vec!["api.example.com".into()],
                timeout_ms: None,
            }),
            schema: Value::Null,
            tags: Vec::new(),
            visibility: Default::default(),
            enabled: true,
            plugin_pre_chain: Vec::new(),
            plugin_post_chain: Vec::new(),
        };
        let mut user = UserContext::anonymous();
        assert!(check_scope("ns", &tool, &user).is_ok());

        user.attributes
            .insert("passthrough_scopes".into(), json!(["ns:tid"]));
        assert!(check_scope("ns", &tool, &user).is_ok());

        user.attributes
            .insert("passthrough_scopes".into(), json!(["ns:other"]));
        assert!(check_scope("ns", &tool, &user).is_err());
    }
}
