//! Deterministic code-execution sessions
//!
//! A session is a per-`(server_id, user_email, language)` directory on a
//! volume mounted identically on every worker, plus a registry row in the
//! cache. The session id and root path are pure functions of the key, so any
//! worker computes the same location without coordination; stub generation is
//! serialized by an advisory lockfile inside the session root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use mcpgate_core::cache::{Cache, keys};
use mcpgate_core::config::CodeExecutionSettings;
use mcpgate_core::dao::{Dao, MountRules, ToolRecord, VirtualServerRecord};
use mcpgate_core::{GatewayError, GatewayResult};

/// Subdirectories of every session root.
pub const TOOLS_DIR: &str = "tools";
/// Approved skills, read-only to the sandbox.
pub const SKILLS_DIR: &str = "skills";
/// Writable scratch space.
pub const SCRATCH_DIR: &str = "scratch";
/// Writable output space.
pub const RESULTS_DIR: &str = "results";
/// Advisory lock serializing stub generation.
pub const LOCK_FILE: &str = ".session.lock";

/// Registry row stored per session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    /// Deterministic session id
    pub session_id: String,
    /// Hash over the mounted tool/skill catalog
    pub content_hash: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last activity
    pub last_used_at: DateTime<Utc>,
    /// Tokenization mapping, purged with the session
    #[serde(default)]
    pub tokens: std::collections::HashMap<String, String>,
}

/// A resolved, materialized session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Deterministic session id
    pub session_id: String,
    /// Session root directory
    pub root: PathBuf,
    /// Registry row at resolution time
    pub row: SessionRow,
}

/// Filesystem-safe slug of a user email.
#[must_use]
pub fn slug(email: &str) -> String {
    let mut out = String::with_capacity(email.len());
    for c in email.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Deterministic session id: first 24 hex chars of
/// SHA-256(`server_id:user_email:language`).
#[must_use]
pub fn session_id(server_id: &str, user_email: &str, language: &str) -> String {
    let digest = Sha256::digest(format!("{server_id}:{user_email}:{language}"));
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()[..24]
        .to_string()
}

/// Deterministic session root under the shared base directory.
#[must_use]
pub fn session_root(base: &Path, server_id: &str, user_email: &str, language: &str) -> PathBuf {
    base.join(server_id)
        .join(slug(user_email))
        .join(session_id(server_id, user_email, language))
}

/// Session manager: registry rows plus on-disk materialization.
pub struct CodeExecSessions {
    settings: CodeExecutionSettings,
    cache: Arc<dyn Cache>,
    dao: Arc<dyn Dao>,
    // In-memory fallback rows when the cache backend is unreachable.
    fallback: DashMap<String, SessionRow>,
}

impl std::fmt::Debug for CodeExecSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExecSessions")
            .field("base_dir", &self.settings.base_dir)
            .finish_non_exhaustive()
    }
}

impl CodeExecSessions {
    /// Manager over the shared volume and registry.
    pub fn new(
        settings: CodeExecutionSettings,
        cache: Arc<dyn Cache>,
        dao: Arc<dyn Dao>,
    ) -> Self {
        Self {
            settings,
            cache,
            dao,
            fallback: DashMap::new(),
        }
    }

    /// Resolve (and materialize, when needed) the session for the key.
    pub async fn ensure_session(
        &self,
        server: &VirtualServerRecord,
        user_email: &str,
        language: &str,
    ) -> GatewayResult<SessionHandle> {
        let sid = session_id(&server.id, user_email, language);
        let root = session_root(
            Path::new(&self.settings.base_dir),
            &server.id,
            user_email,
            language,
        );
        let registry_key = keys::code_exec_session(&server.id, &slug(user_email), language);

        let mounted = self.mounted_tools(server).await?;
        let skills = self.approved_skills(server);
        let content_hash = catalog_hash(&mounted, &skills);

        // A matching row means another worker already materialized this
        // exact catalog; refresh the TTL and go.
        if let Some(mut row) = self.load_row(&registry_key).await {
            if row.content_hash == content_hash && root.join(TOOLS_DIR).is_dir() {
                row.last_used_at = Utc::now();
                self.store_row(&registry_key, &row).await;
                return Ok(SessionHandle {
                    session_id: sid,
                    root,
                    row,
                });
            }
        }

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| GatewayError::internal(format!("session root: {e}")))?;

        let row = self
            .materialize(&root, &sid, &content_hash, &mounted, &skills, language)
            .await?;
        self.store_row(&registry_key, &row).await;
        Ok(SessionHandle {
            session_id: sid,
            root,
            row,
        })
    }

    /// Refresh the registry TTL on activity.
    pub async fn touch(&self, server_id: &str, user_email: &str, language: &str) {
        let registry_key = keys::code_exec_session(server_id, &slug(user_email), language);
        if let Some(mut row) = self.load_row(&registry_key).await {
            row.last_used_at = Utc::now();
            self.store_row(&registry_key, &row).await;
        }
    }

    async fn load_row(&self, registry_key: &str) -> Option<SessionRow> {
        match self.cache.get(registry_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                // Degraded mode: single-worker semantics from local memory.
                warn!(error = %e, "cache unreachable; using in-memory session registry");
                self.fallback.get(registry_key).map(|r| r.clone())
            }
        }
    }

    async fn store_row(&self, registry_key: &str, row: &SessionRow) {
        let ttl = Duration::from_secs(self.settings.session_ttl_seconds);
        let serialized = match serde_json::to_string(row) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "session row serialization failed");
                return;
            }
        };
        if let Err(e) = self.cache.set(registry_key, &serialized, Some(ttl)).await {
            warn!(error = %e, "cache unreachable; storing session row in memory");
            self.fallback.insert(registry_key.to_string(), row.clone());
        }
    }

    /// Mounted tools per the server's mount rules, include-then-exclude.
    async fn mounted_tools(&self, server: &VirtualServerRecord) -> GatewayResult<Vec<ToolRecord>> {
        let all = self.dao.list_tools().await?;
        let rules = &server.mount_rules;
        Ok(all
            .into_iter()
            .filter(|tool| {
                tool.enabled
                    && (server.associated_tool_ids.is_empty()
                        || server.associated_tool_ids.contains(&tool.id))
                    && mount_included(rules, tool)
            })
            .collect())
    }

    /// Skill files for the server's scope. Skills live under
    /// `{base}/.skills/{scope-slug}`, maintained by the external skills
    /// module; with approval required, only names listed in `approved.json`
    /// mount.
    fn approved_skills(&self, server: &VirtualServerRecord) -> Vec<PathBuf> {
        let Some(scope) = &server.skills_scope else {
            return Vec::new();
        };
        let dir = Path::new(&self.settings.base_dir)
            .join(".skills")
            .join(slug(scope));
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let approved: Option<Vec<String>> = if server.skills_require_approval {
            std::fs::read_to_string(dir.join("approved.json"))
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
        } else {
            None
        };
        let mut skills: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name().is_some_and(|n| n != "approved.json")
                    && match &approved {
                        Some(listed) => p
                            .file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| listed.iter().any(|a| a == n)),
                        None => !server.skills_require_approval,
                    }
            })
            .collect();
        skills.sort();
        skills
    }

    /// Generate `/tools`, `/skills`, `/scratch`, `/results` under the lock.
    async fn materialize(
        &self,
        root: &Path,
        sid: &str,
        content_hash: &str,
        mounted: &[ToolRecord],
        skills: &[PathBuf],
        language: &str,
    ) -> GatewayResult<SessionRow> {
        let _lock = SessionLock::acquire(
            &root.join(LOCK_FILE),
            Duration::from_secs(self.settings.lock_wait_seconds),
        )
        .await?;

        for dir in [TOOLS_DIR, SKILLS_DIR, SCRATCH_DIR, RESULTS_DIR] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| GatewayError::internal(format!("session dir {dir}: {e}")))?;
        }

        let tools_dir = root.join(TOOLS_DIR);
        let catalog: Vec<_> = mounted
            .iter()
            .map(|t| json!({"name": t.name, "schema": t.schema, "tags": t.tags}))
            .collect();
        tokio::fs::write(
            tools_dir.join("catalog.json"),
            serde_json::to_vec_pretty(&json!({"tools": catalog}))?,
        )
        .await
        .map_err(|e| GatewayError::internal(format!("catalog write: {e}")))?;

        for tool in mounted {
            let (file_name, stub) = tool_stub(&tool.name, language);
            tokio::fs::write(tools_dir.join(file_name), stub)
                .await
                .map_err(|e| GatewayError::internal(format!("stub write: {e}")))?;
        }

        let skills_dir = root.join(SKILLS_DIR);
        for skill in skills {
            if let Some(name) = skill.file_name() {
                if let Err(e) = tokio::fs::copy(skill, skills_dir.join(name)).await {
                    warn!(skill = %skill.display(), error = %e, "skill mount failed");
                }
            }
        }

        debug!(session_id = sid, tools = mounted.len(), "session materialized");
        Ok(SessionRow {
            session_id: sid.to_string(),
            content_hash: content_hash.to_string(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            tokens: std::collections::HashMap::new(),
        })
    }
}

fn mount_included(rules: &MountRules, tool: &ToolRecord) -> bool {
    // Include filters first; empty include lists admit everything.
    let included_by_tags = rules.include_tags.is_empty()
        || tool.tags.iter().any(|t| rules.include_tags.contains(t));
    let included_by_server = rules.include_servers.is_empty()
        || tool
            .gateway_id
            .as_ref()
            .is_some_and(|g| rules.include_servers.contains(g));
    let included_by_name =
        rules.include_tools.is_empty() || rules.include_tools.contains(&tool.name);
    if !(included_by_tags && included_by_server && included_by_name) {
        return false;
    }
    // Then excludes.
    if tool.tags.iter().any(|t| rules.exclude_tags.contains(t)) {
        return false;
    }
    if tool
        .gateway_id
        .as_ref()
        .is_some_and(|g| rules.exclude_servers.contains(g))
    {
        return false;
    }
    !rules.exclude_tools.contains(&tool.name)
}

/// Hash over the mounted catalog; a match lets workers skip regeneration.
fn catalog_hash(tools: &[ToolRecord], skills: &[PathBuf]) -> String {
    let mut names: Vec<String> = tools
        .iter()
        .map(|t| format!("{}:{}", t.name, t.schema))
        .collect();
    names.sort();
    let skill_names: Vec<String> = skills
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    let digest = Sha256::digest(format!("{names:?}|{skill_names:?}"));
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn tool_stub(name: &str, language: &str) -> (String, String) {
    match language {
        "python" => (
            format!("{name}.py"),
            format!(
                "from _bridge import call_tool\n\n\ndef {fn}(**kwargs):\n    return call_tool(\"{name}\", kwargs)\n",
                fn = name.replace('-', "_"),
            ),
        ),
        _ => (
            format!("{name}.ts"),
            format!(
                "import {{ callTool }} from \"./_bridge.ts\";\n\nexport function {fn}(args: Record<string, unknown>) {{\n  return callTool(\"{name}\", args);\n}}\n",
                fn = name.replace('-', "_"),
            ),
        ),
    }
}

/// Advisory exclusive lock on the session lockfile.
struct SessionLock {
    file: std::fs::File,
}

impl SessionLock {
    async fn acquire(path: &Path, wait: Duration) -> GatewayResult<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| GatewayError::internal(format!("lockfile: {e}")))?;
        let deadline = std::time::Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(GatewayError::timeout(
                        format!("session lock ({e})"),
                        wait.as_millis() as u64,
                    ));
                }
            }
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_core::dao::{Integration, ServerType, Visibility};
    use mcpgate_core::{MemoryCache, MemoryDao};
    use pretty_assertions::assert_eq;

    fn tool(name: &str, tags: &[&str], gateway: &str) -> ToolRecord {
        ToolRecord {
            id: format!("id-{name}"),
            gateway_id: Some(gateway.into()),
            team_id: None,
            owner_id: None,
            name: name.into(),
            integration: Integration::Mcp {
                remote_name: name.into(),
            },
            schema: serde_json::Value::Null,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            visibility: Visibility::Public,
            enabled: true,
            plugin_pre_chain: Vec::new(),
            plugin_post_chain: Vec::new(),
        }
    }

    fn server(id: &str) -> VirtualServerRecord {
        VirtualServerRecord {
            id: id.into(),
            name: id.into(),
            server_type: ServerType::CodeExecution,
            sandbox_policy: Default::default(),
            mount_rules: Default::default(),
            tokenization: Default::default(),
            skills_scope: None,
            skills_require_approval: false,
            associated_tool_ids: Vec::new(),
            associated_resource_ids: Vec::new(),
            associated_prompt_ids: Vec::new(),
        }
    }

    #[test]
    fn session_ids_are_deterministic_and_24_hex() {
        let a = session_id("s1", "alice@example.com", "python");
        let b = session_id("s1", "alice@example.com", "python");
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, session_id("s1", "alice@example.com", "deno"));
        assert_ne!(a, session_id("s2", "alice@example.com", "python"));
    }

    #[test]
    fn roots_are_deterministic_across_workers() {
        let base = Path::new("/var/lib/mcpgate/sessions");
        let a = session_root(base, "s1", "Alice@Example.com", "python");
        let b = session_root(base, "s1", "Alice@Example.com", "python");
        assert_eq!(a, b);
        assert!(a.starts_with("/var/lib/mcpgate/sessions/s1/alice-example-com"));
    }

    #[test]
    fn slug_strips_unsafe_characters() {
        assert_eq!(slug("Alice+test@Example.com"), "alice-test-example-com");
        assert_eq!(slug("--x--"), "x");
    }

    #[test]
    fn mount_rules_include_then_exclude() {
        let mut rules = MountRules::default();
        assert!(mount_included(&rules, &tool("a", &["net"], "g1")));

        rules.include_tags = vec!["net".into()];
        assert!(mount_included(&rules, &tool("a", &["net"], "g1")));
        assert!(!mount_included(&rules, &tool("b", &["db"], "g1")));

        rules.exclude_tools = vec!["a".into()];
        assert!(!mount_included(&rules, &tool("a", &["net"], "g1")));

        let mut rules = MountRules {
            include_servers: vec!["g1".into()],
            exclude_servers: vec!["g2".into()],
            ..MountRules::default()
        };
        assert!(mount_included(&rules, &tool("a", &[], "g1")));
        assert!(!mount_included(&rules, &tool("a", &[], "g2")));
        rules.include_servers.push("g2".into());
        // Exclude wins after include.
        assert!(!mount_included(&rules, &tool("a", &[], "g2")));
    }

    #[tokio::test]
    async fn ensure_session_materializes_once_and_reuses() {
        let base = tempfile::tempdir().unwrap();
        let settings = CodeExecutionSettings {
            enabled: true,
            base_dir: base.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let dao = Arc::new(MemoryDao::new());
        dao.upsert_tool(tool("echo", &[], "g1")).await.unwrap();
        let cache = Arc::new(MemoryCache::new());
        let sessions = CodeExecSessions::new(settings, cache, dao);

        let srv = server("s1");
        let first = sessions
            .ensure_session(&srv, "alice@example.com", "python")
            .await
            .unwrap();
        assert!(first.root.join(TOOLS_DIR).join("catalog.json").is_file());
        assert!(first.root.join(TOOLS_DIR).join("echo.py").is_file());
        assert!(first.root.join(SCRATCH_DIR).is_dir());
        assert!(first.root.join(RESULTS_DIR).is_dir());

        // Same catalog: reuse, same id, no regeneration needed.
        let second = sessions
            .ensure_session(&srv, "alice@example.com", "python")
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.row.content_hash, second.row.content_hash);
    }

    #[tokio::test]
    async fn catalog_change_triggers_regeneration() {
        let base = tempfile::tempdir().unwrap();
        let settings = CodeExecutionSettings {
            enabled: true,
            base_dir: base.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let dao: Arc<dyn Dao> = Arc::new(MemoryDao::new());
        dao.upsert_tool(tool("echo", &[], "g1")).await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let sessions = CodeExecSessions::new(settings, Arc::clone(&cache), Arc::clone(&dao));

        let srv = server("s1");
        let first = sessions
            .ensure_session(&srv, "alice@example.com", "python")
            .await
            .unwrap();

        dao.upsert_tool(tool("extra", &[], "g1")).await.unwrap();
        let second = sessions
            .ensure_session(&srv, "alice@example.com", "python")
            .await
            .unwrap();
        assert_ne!(first.row.content_hash, second.row.content_hash);
        assert!(second.root.join(TOOLS_DIR).join("extra.py").is_file());
    }
}
