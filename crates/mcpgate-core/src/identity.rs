//! Identity and passthrough handling
//!
//! Turns raw authentication material into a [`UserContext`] and controls what
//! identity crosses the upstream boundary. The gateway never trusts
//! client-supplied `X-Forwarded-User-*` headers; they are stripped on the way
//! in and re-emitted (optionally signed) on the way out.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{GatewayError, GatewayResult};

/// Headers that participate in the pool identity hash.
const IDENTITY_HASH_HEADERS: [&str; 5] = [
    "authorization",
    "cookie",
    "x-api-key",
    "x-tenant-id",
    "x-user-id",
];

/// Prefix of every propagated identity header.
pub const FORWARDED_USER_PREFIX: &str = "x-forwarded-user-";

/// Correlation header stripped before pooling (sticky headers would leak it
/// across requests sharing a pooled session).
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// JWT bearer token
    Bearer,
    /// Static API key
    ApiKey,
    /// HTTP basic credentials
    Basic,
    /// Trusted SSO proxy headers
    SsoProxy,
    /// No credential; anonymous access enabled
    Anonymous,
}

impl AuthMethod {
    /// Wire name of the method, used in audit records and headers.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::ApiKey => "api_key",
            Self::Basic => "basic",
            Self::SsoProxy => "sso_proxy",
            Self::Anonymous => "anonymous",
        }
    }
}

/// Full identity record populated on every authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    /// Stable user identifier
    pub user_id: String,
    /// Email address
    pub email: Option<String>,
    /// Display name
    pub full_name: Option<String>,
    /// Whether the user is a platform admin
    pub is_admin: bool,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
    /// Role names
    #[serde(default)]
    pub roles: Vec<String>,
    /// Primary team
    pub team_id: Option<String>,
    /// All team memberships
    #[serde(default)]
    pub teams: Vec<String>,
    /// Organizational department
    pub department: Option<String>,
    /// Free-form attributes; filtered before propagation
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// How the caller authenticated
    pub auth_method: AuthMethod,
    /// When authentication happened
    pub authenticated_at: DateTime<Utc>,
    /// Set for non-human principals
    pub service_account: Option<String>,
    /// Principals this request was delegated through, oldest first
    #[serde(default)]
    pub delegation_chain: Vec<String>,
}

impl UserContext {
    /// Anonymous identity used when no credential is present and anonymous
    /// access is enabled.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            email: None,
            full_name: None,
            is_admin: false,
            groups: Vec::new(),
            roles: Vec::new(),
            team_id: None,
            teams: Vec::new(),
            department: None,
            attributes: HashMap::new(),
            auth_method: AuthMethod::Anonymous,
            authenticated_at: Utc::now(),
            service_account: None,
            delegation_chain: Vec::new(),
        }
    }

    /// Copy of this context with sensitive attributes removed, for handing to
    /// sandboxed code or the tool bridge.
    #[must_use]
    pub fn scrubbed(&self, sensitive_attributes: &[String]) -> Self {
        let mut ctx = self.clone();
        ctx.attributes
            .retain(|k, _| !sensitive_attributes.iter().any(|s| s.eq_ignore_ascii_case(k)));
        ctx
    }
}

/// Propagation mode for identity at the upstream boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationMode {
    /// `X-Forwarded-User-*` headers only
    #[default]
    Headers,
    /// MCP `_meta` object only
    Meta,
    /// Both headers and `_meta`
    Both,
}

/// Per-gateway identity propagation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityPropagation {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,
    /// Headers, meta, or both
    #[serde(default)]
    pub mode: PropagationMode,
    /// Attribute names allowed to propagate; empty allows none
    #[serde(default)]
    pub attribute_allowlist: Vec<String>,
    /// Attribute names never emitted regardless of the allowlist
    #[serde(default)]
    pub sensitive_attributes: Vec<String>,
    /// Append an HMAC signature header over the emitted claims
    #[serde(default)]
    pub sign_claims: bool,
}

/// JWT claims the authenticator understands.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    teams: Vec<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    department: Option<String>,
}

/// A configured API key principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyPrincipal {
    /// SHA-256 hex digest of the key material
    pub key_sha256: String,
    /// Principal the key authenticates as
    pub user_id: String,
    /// Team the principal belongs to
    pub team_id: Option<String>,
    /// Marks the principal as a service account
    #[serde(default)]
    pub service_account: Option<String>,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Allow unauthenticated requests
    #[serde(default)]
    pub anonymous_enabled: bool,
    /// HS256 secret for bearer token validation
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Configured API keys
    #[serde(default)]
    pub api_keys: Vec<ApiKeyPrincipal>,
    /// Basic-auth users, password stored as SHA-256 hex
    #[serde(default)]
    pub basic_users: HashMap<String, String>,
    /// Accept identity headers from a fronting SSO proxy
    #[serde(default)]
    pub trust_sso_proxy: bool,
    /// Secret for `X-Forwarded-User-Signature`
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Extra request headers deleted before any outbound call
    #[serde(default)]
    pub header_deny_list: Vec<String>,
}

/// Builds `UserContext`s and produces/strips identity headers.
#[derive(Debug, Clone)]
pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    /// Create an authenticator from settings.
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Authenticate a request from its headers.
    ///
    /// Precedence: bearer > api_key > basic > sso_proxy. Fails with
    /// [`GatewayError::AuthRequired`] when no credential is present and
    /// anonymous access is disabled, and with `AuthInvalid` when a credential
    /// is present but does not verify.
    pub fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<UserContext> {
        if let Some(token) = bearer_token(headers) {
            return self.authenticate_bearer(token);
        }
        if let Some(key) = header_str(headers, "x-api-key") {
            return self.authenticate_api_key(key);
        }
        if let Some(creds) = basic_credentials(headers)? {
            return self.authenticate_basic(&creds.0, &creds.1);
        }
        if self.config.trust_sso_proxy
            && let Some(user) = header_str(headers, "x-auth-request-user")
        {
            return Ok(self.sso_context(user, header_str(headers, "x-auth-request-email")));
        }
        if self.config.anonymous_enabled {
            return Ok(UserContext::anonymous());
        }
        Err(GatewayError::AuthRequired)
    }

    fn authenticate_bearer(&self, token: &str) -> GatewayResult<UserContext> {
        let Some(secret) = self.config.jwt_secret.as_deref() else {
            return Err(GatewayError::auth_invalid_with_method(
                "bearer tokens are not accepted by this gateway",
                "bearer",
            ));
        };
        let key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());
        let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        let data = jsonwebtoken::decode::<TokenClaims>(token, &key, &validation)
            .map_err(|e| GatewayError::auth_invalid_with_method(e.to_string(), "bearer"))?;
        let claims = data.claims;
        Ok(UserContext {
            user_id: claims.sub,
            email: claims.email,
            full_name: claims.name,
            is_admin: claims.admin,
            groups: claims.groups,
            roles: claims.roles,
            team_id: claims.team_id,
            teams: claims.teams,
            department: claims.department,
            attributes: HashMap::new(),
            auth_method: AuthMethod::Bearer,
            authenticated_at: Utc::now(),
            service_account: None,
            delegation_chain: Vec::new(),
        })
    }

    fn authenticate_api_key(&self, key: &str) -> GatewayResult<UserContext> {
        let digest = sha256_hex(key.as_bytes());
        let principal = self
            .config
            .api_keys
            .iter()
            .find(|p| bool::from(p.key_sha256.as_bytes().ct_eq(digest.as_bytes())))
            .ok_or_else(|| {
                GatewayError::auth_invalid_with_method("unknown API key", "api_key")
            })?;
        let mut ctx = UserContext::anonymous();
        ctx.user_id = principal.user_id.clone();
        ctx.team_id = principal.team_id.clone();
        ctx.teams = principal.team_id.iter().cloned().collect();
        ctx.service_account = principal.service_account.clone();
        ctx.auth_method = AuthMethod::ApiKey;
        Ok(ctx)
    }

    fn authenticate_basic(&self, user: &str, password: &str) -> GatewayResult<UserContext> {
        let stored = self.config.basic_users.get(user).ok_or_else(|| {
            GatewayError::auth_invalid_with_method("unknown user", "basic")
        })?;
        let digest = sha256_hex(password.as_bytes());
        if !bool::from(stored.as_bytes().ct_eq(digest.as_bytes())) {
            return Err(GatewayError::auth_invalid_with_method(
                "password mismatch",
                "basic",
            ));
        }
        let mut ctx = UserContext::anonymous();
        ctx.user_id = user.to_string();
        ctx.auth_method = AuthMethod::Basic;
        Ok(ctx)
    }

    fn sso_context(&self, user: &str, email: Option<&str>) -> UserContext {
        let mut ctx = UserContext::anonymous();
        ctx.user_id = user.to_string();
        ctx.email = email.map(str::to_string);
        ctx.auth_method = AuthMethod::SsoProxy;
        ctx
    }

    /// Delete client-supplied identity and correlation headers.
    ///
    /// Runs unconditionally before pool acquire and before every outbound
    /// call, so spoofed `X-Forwarded-User-*` headers can neither reach an
    /// upstream nor pollute a pooled session.
    pub fn scrub_request_headers(&self, headers: &mut HeaderMap) {
        let doomed: Vec<HeaderName> = headers
            .keys()
            .filter(|name| {
                let name = name.as_str();
                name.starts_with(FORWARDED_USER_PREFIX)
                    || name == CORRELATION_HEADER
                    || self
                        .config
                        .header_deny_list
                        .iter()
                        .any(|d| d.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();
        for name in doomed {
            headers.remove(&name);
        }
    }

    /// Produce the `X-Forwarded-User-*` headers for an upstream request.
    ///
    /// Empty when propagation is disabled or the mode is `Meta`. When
    /// `sign_claims` is set, appends `X-Forwarded-User-Signature` computed
    /// over the canonical header string.
    pub fn build_identity_headers(
        &self,
        ctx: &UserContext,
        propagation: &IdentityPropagation,
    ) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if !propagation.enabled || propagation.mode == PropagationMode::Meta {
            return Ok(headers);
        }

        let mut pairs: BTreeMap<&'static str, String> = BTreeMap::new();
        pairs.insert("x-forwarded-user-id", ctx.user_id.clone());
        if let Some(email) = &ctx.email {
            pairs.insert("x-forwarded-user-email", email.clone());
        }
        if !ctx.teams.is_empty() {
            pairs.insert("x-forwarded-user-teams", ctx.teams.join(","));
        }
        if !ctx.roles.is_empty() {
            pairs.insert("x-forwarded-user-roles", ctx.roles.join(","));
        }
        pairs.insert("x-forwarded-user-admin", ctx.is_admin.to_string());
        pairs.insert(
            "x-forwarded-user-auth-method",
            ctx.auth_method.as_str().to_string(),
        );
        if !ctx.delegation_chain.is_empty() {
            pairs.insert(
                "x-forwarded-user-delegation-chain",
                ctx.delegation_chain.join(","),
            );
        }

        for (name, value) in &pairs {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::internal(format!("identity header value: {e}"))
                })?,
            );
        }

        if propagation.sign_claims {
            let secret = self.config.signing_secret.as_deref().ok_or_else(|| {
                GatewayError::internal("sign_claims enabled without a signing secret")
            })?;
            let canonical = canonical_header_string(&pairs);
            let tag = hmac::sign(
                &hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
                canonical.as_bytes(),
            );
            headers.insert(
                HeaderName::from_static("x-forwarded-user-signature"),
                HeaderValue::from_str(&hex_encode(tag.as_ref()))
                    .map_err(|e| GatewayError::internal(format!("signature header: {e}")))?,
            );
        }

        Ok(headers)
    }

    /// Produce the MCP `_meta.user` object for an upstream request.
    ///
    /// `None` when propagation is disabled or the mode is `Headers`.
    #[must_use]
    pub fn build_identity_meta(
        &self,
        ctx: &UserContext,
        propagation: &IdentityPropagation,
    ) -> Option<Value> {
        if !propagation.enabled || propagation.mode == PropagationMode::Headers {
            return None;
        }
        let attributes: serde_json::Map<String, Value> = ctx
            .attributes
            .iter()
            .filter(|(k, _)| {
                propagation
                    .attribute_allowlist
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(k))
                    && !propagation
                        .sensitive_attributes
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(k))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(json!({
            "user": {
                "id": ctx.user_id,
                "email": ctx.email,
                "teams": ctx.teams,
                "roles": ctx.roles,
                "admin": ctx.is_admin,
                "auth_method": ctx.auth_method.as_str(),
                "delegation_chain": ctx.delegation_chain,
                "attributes": attributes,
            }
        }))
    }
}

/// Stable digest over the caller's authentication headers.
///
/// Requests with different hashes never share a pooled upstream session.
/// Returns the literal `"anonymous"` when none of the participating headers
/// are present.
#[must_use]
pub fn identity_hash(headers: &HeaderMap) -> String {
    let mut material: Vec<String> = Vec::new();
    for name in IDENTITY_HASH_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            material.push(format!("{name}={value}"));
        }
    }
    if material.is_empty() {
        return "anonymous".to_string();
    }
    sha256_hex(material.join("\n").as_bytes())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ")
}

fn basic_credentials(headers: &HeaderMap) -> GatewayResult<Option<(String, String)>> {
    let Some(encoded) = header_str(headers, "authorization").and_then(|v| v.strip_prefix("Basic "))
    else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| GatewayError::auth_invalid_with_method("malformed basic credentials", "basic"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| GatewayError::auth_invalid_with_method("malformed basic credentials", "basic"))?;
    let (user, password) = decoded.split_once(':').ok_or_else(|| {
        GatewayError::auth_invalid_with_method("malformed basic credentials", "basic")
    })?;
    Ok(Some((user.to_string(), password.to_string())))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn canonical_header_string(pairs: &BTreeMap<&'static str, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Hex-encode a SHA-256 digest of the input.
#[must_use]
pub fn sha256_hex(input: &[u8]) -> String {
    hex_encode(&Sha256::digest(input))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn authenticator(anonymous: bool) -> Authenticator {
        Authenticator::new(AuthConfig {
            anonymous_enabled: anonymous,
            signing_secret: Some("gate-secret".into()),
            ..AuthConfig::default()
        })
    }

    #[test]
    fn no_credential_fails_when_anonymous_disabled() {
        let err = authenticator(false)
            .authenticate(&HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthRequired));
    }

    #[test]
    fn no_credential_is_anonymous_when_enabled() {
        let ctx = authenticator(true).authenticate(&HeaderMap::new()).unwrap();
        assert_eq!(ctx.user_id, "anonymous");
        assert_eq!(ctx.auth_method, AuthMethod::Anonymous);
    }

    #[test]
    fn api_key_resolves_principal() {
        let auth = Authenticator::new(AuthConfig {
            api_keys: vec![ApiKeyPrincipal {
                key_sha256: sha256_hex(b"k-123"),
                user_id: "svc-ci".into(),
                team_id: Some("eng".into()),
                service_account: Some("ci".into()),
            }],
            ..AuthConfig::default()
        });
        let ctx = auth
            .authenticate(&headers(&[("x-api-key", "k-123")]))
            .unwrap();
        assert_eq!(ctx.user_id, "svc-ci");
        assert_eq!(ctx.auth_method, AuthMethod::ApiKey);
        assert_eq!(ctx.service_account.as_deref(), Some("ci"));

        let err = auth
            .authenticate(&headers(&[("x-api-key", "wrong")]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthInvalid { .. }));
    }

    #[test]
    fn basic_auth_checks_password_digest() {
        let auth = Authenticator::new(AuthConfig {
            basic_users: HashMap::from([("alice".to_string(), sha256_hex(b"pw"))]),
            ..AuthConfig::default()
        });
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:pw");
        let ctx = auth
            .authenticate(&headers(&[("authorization", &format!("Basic {encoded}"))]))
            .unwrap();
        assert_eq!(ctx.user_id, "alice");
        assert_eq!(ctx.auth_method, AuthMethod::Basic);

        let bad = base64::engine::general_purpose::STANDARD.encode("alice:nope");
        assert!(auth
            .authenticate(&headers(&[("authorization", &format!("Basic {bad}"))]))
            .is_err());
    }

    #[test]
    fn identity_hash_is_anonymous_without_auth_headers() {
        assert_eq!(identity_hash(&HeaderMap::new()), "anonymous");
        assert_eq!(
            identity_hash(&headers(&[("content-type", "application/json")])),
            "anonymous"
        );
    }

    #[test]
    fn identity_hash_separates_identities() {
        let a = identity_hash(&headers(&[("authorization", "Bearer a")]));
        let b = identity_hash(&headers(&[("authorization", "Bearer b")]));
        assert_ne!(a, b);
        // Stable across calls.
        assert_eq!(a, identity_hash(&headers(&[("authorization", "Bearer a")])));
    }

    #[test]
    fn scrub_removes_spoofed_and_denied_headers() {
        let auth = Authenticator::new(AuthConfig {
            header_deny_list: vec!["x-internal-debug".into()],
            ..AuthConfig::default()
        });
        let mut map = headers(&[
            ("x-forwarded-user-id", "mallory"),
            ("x-forwarded-user-admin", "true"),
            ("x-correlation-id", "abc"),
            ("x-internal-debug", "1"),
            ("authorization", "Bearer tok"),
        ]);
        auth.scrub_request_headers(&mut map);
        assert!(map.get("x-forwarded-user-id").is_none());
        assert!(map.get("x-forwarded-user-admin").is_none());
        assert!(map.get("x-correlation-id").is_none());
        assert!(map.get("x-internal-debug").is_none());
        assert!(map.get("authorization").is_some());
    }

    #[test]
    fn propagation_emits_forwarded_headers_and_signature() {
        let auth = authenticator(true);
        let mut ctx = UserContext::anonymous();
        ctx.user_id = "u-alice".into();
        ctx.email = Some("alice@example.com".into());
        ctx.teams = vec!["eng".into()];
        ctx.auth_method = AuthMethod::Bearer;

        let propagation = IdentityPropagation {
            enabled: true,
            mode: PropagationMode::Both,
            sign_claims: true,
            ..IdentityPropagation::default()
        };
        let headers = auth.build_identity_headers(&ctx, &propagation).unwrap();
        assert_eq!(
            headers.get("x-forwarded-user-email").unwrap(),
            "alice@example.com"
        );
        assert_eq!(headers.get("x-forwarded-user-admin").unwrap(), "false");
        assert_eq!(headers.get("x-forwarded-user-teams").unwrap(), "eng");
        let sig = headers.get("x-forwarded-user-signature").unwrap();
        assert_eq!(sig.to_str().unwrap().len(), 64);

        let meta = auth.build_identity_meta(&ctx, &propagation).unwrap();
        assert_eq!(meta["user"]["email"], "alice@example.com");
        assert_eq!(meta["user"]["admin"], false);
    }

    #[test]
    fn sensitive_attributes_never_reach_meta() {
        let auth = authenticator(true);
        let mut ctx = UserContext::anonymous();
        ctx.attributes.insert("clearance".into(), json!("top"));
        ctx.attributes.insert("locale".into(), json!("en"));

        let propagation = IdentityPropagation {
            enabled: true,
            mode: PropagationMode::Meta,
            attribute_allowlist: vec!["clearance".into(), "locale".into()],
            sensitive_attributes: vec!["clearance".into()],
            ..IdentityPropagation::default()
        };
        let meta = auth.build_identity_meta(&ctx, &propagation).unwrap();
        assert!(meta["user"]["attributes"].get("clearance").is_none());
        assert_eq!(meta["user"]["attributes"]["locale"], "en");
    }

    #[test]
    fn disabled_propagation_emits_nothing() {
        let auth = authenticator(true);
        let ctx = UserContext::anonymous();
        let propagation = IdentityPropagation::default();
        assert!(auth
            .build_identity_headers(&ctx, &propagation)
            .unwrap()
            .is_empty());
        assert!(auth.build_identity_meta(&ctx, &propagation).is_none());
    }
}
