//! Entity catalog: visibility scoping and name resolution
//!
//! Lists are filtered to what the caller may see, ordered stably by
//! `(team_id, name)`, and paginated with `(page, per_page)`. A name resolves
//! deterministically to exactly one entity for a given caller: candidates in
//! the caller's own team win, then the lexically first `(gateway_id, id)`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use mcpgate_core::dao::{Dao, PromptRecord, ResourceRecord, ToolRecord, Visibility};
use mcpgate_core::{GatewayError, GatewayResult, UserContext};

/// Pagination window; defaults to the first fifty entries.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: usize,
    /// Entries per page
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    50
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 50,
        }
    }
}

impl Page {
    fn slice<T>(&self, mut items: Vec<T>) -> Vec<T> {
        let per_page = self.per_page.max(1);
        let start = (self.page.max(1) - 1) * per_page;
        if start >= items.len() {
            return Vec::new();
        }
        items.drain(..start);
        items.truncate(per_page);
        items
    }
}

/// Visibility decision shared by every entity kind.
fn visible(
    visibility: Visibility,
    team_id: Option<&str>,
    owner_id: Option<&str>,
    user: &UserContext,
) -> bool {
    if user.is_admin {
        return true;
    }
    match visibility {
        Visibility::Public => true,
        Visibility::Team => team_id.is_some_and(|team| {
            user.team_id.as_deref() == Some(team) || user.teams.iter().any(|t| t == team)
        }),
        Visibility::Private => owner_id.is_some_and(|owner| owner == user.user_id),
    }
}

/// Read-side catalog over the DAO.
#[derive(Debug, Clone)]
pub struct Catalog {
    dao: Arc<dyn Dao>,
}

impl Catalog {
    /// Catalog over the given store.
    pub fn new(dao: Arc<dyn Dao>) -> Self {
        Self { dao }
    }

    /// Tools visible to the caller, as MCP tool descriptors.
    pub async fn list_tools(&self, user: &UserContext, page: Page) -> GatewayResult<Vec<Value>> {
        let mut tools: Vec<ToolRecord> = self
            .dao
            .list_tools()
            .await?
            .into_iter()
            .filter(|t| t.enabled && visible(t.visibility, t.team_id.as_deref(), t.owner_id.as_deref(), user))
            .collect();
        tools.sort_by(|a, b| (&a.team_id, &a.name).cmp(&(&b.team_id, &b.name)));
        Ok(page
            .slice(tools)
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.schema.get("description").cloned().unwrap_or(Value::Null),
                    "inputSchema": if t.schema.is_null() { json!({"type": "object"}) } else { t.schema.clone() },
                })
            })
            .collect())
    }

    /// Resources visible to the caller.
    pub async fn list_resources(
        &self,
        user: &UserContext,
        page: Page,
    ) -> GatewayResult<Vec<Value>> {
        let mut resources: Vec<ResourceRecord> = self
            .dao
            .list_resources()
            .await?
            .into_iter()
            .filter(|r| r.enabled && visible(r.visibility, r.team_id.as_deref(), r.owner_id.as_deref(), user))
            .collect();
        resources.sort_by(|a, b| (&a.team_id, &a.name).cmp(&(&b.team_id, &b.name)));
        Ok(page
            .slice(resources)
            .into_iter()
            .map(|r| json!({"name": r.name, "uri": r.uri}))
            .collect())
    }

    /// Prompts visible to the caller.
    pub async fn list_prompts(&self, user: &UserContext, page: Page) -> GatewayResult<Vec<Value>> {
        let mut prompts: Vec<PromptRecord> = self
            .dao
            .list_prompts()
            .await?
            .into_iter()
            .filter(|p| p.enabled && visible(p.visibility, p.team_id.as_deref(), p.owner_id.as_deref(), user))
            .collect();
        prompts.sort_by(|a, b| (&a.team_id, &a.name).cmp(&(&b.team_id, &b.name)));
        Ok(page
            .slice(prompts)
            .into_iter()
            .map(|p| json!({"name": p.name}))
            .collect())
    }

    /// Fetch a tool by id, subject to the caller's visibility scope.
    pub async fn tool_by_id(&self, id: &str, user: &UserContext) -> GatewayResult<ToolRecord> {
        let tool = self
            .dao
            .get_tool(id)
            .await?
            .filter(|t| {
                t.enabled && visible(t.visibility, t.team_id.as_deref(), t.owner_id.as_deref(), user)
            })
            .ok_or_else(|| GatewayError::not_found(format!("tool '{id}'")))?;
        Ok(tool)
    }

    /// Resolve a tool name for the caller. Exactly one record wins: own-team
    /// candidates first, then stable `(gateway_id, id)` order.
    pub async fn resolve_tool(&self, name: &str, user: &UserContext) -> GatewayResult<ToolRecord> {
        let mut candidates: Vec<ToolRecord> = self
            .dao
            .list_tools()
            .await?
            .into_iter()
            .filter(|t| {
                t.enabled
                    && t.name == name
                    && visible(t.visibility, t.team_id.as_deref(), t.owner_id.as_deref(), user)
            })
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::not_found(format!("tool '{name}'")));
        }
        candidates.sort_by(|a, b| {
            let a_own = a.team_id.as_deref() == user.team_id.as_deref();
            let b_own = b.team_id.as_deref() == user.team_id.as_deref();
            b_own
                .cmp(&a_own)
                .then_with(|| (&a.gateway_id, &a.id).cmp(&(&b.gateway_id, &b.id)))
        });
        Ok(candidates.remove(0))
    }

    /// Resolve a resource by URI for the caller.
    pub async fn resolve_resource(
        &self,
        uri: &str,
        user: &UserContext,
    ) -> GatewayResult<ResourceRecord> {
        let mut candidates: Vec<ResourceRecord> = self
            .dao
            .list_resources()
            .await?
            .into_iter()
            .filter(|r| {
                r.enabled
                    && r.uri == uri
                    && visible(r.visibility, r.team_id.as_deref(), r.owner_id.as_deref(), user)
            })
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::not_found(format!("resource '{uri}'")));
        }
        candidates.sort_by(|a, b| (&a.gateway_id, &a.id).cmp(&(&b.gateway_id, &b.id)));
        Ok(candidates.remove(0))
    }

    /// Resolve a prompt name for the caller.
    pub async fn resolve_prompt(
        &self,
        name: &str,
        user: &UserContext,
    ) -> GatewayResult<PromptRecord> {
        let mut candidates: Vec<PromptRecord> = self
            .dao
            .list_prompts()
            .await?
            .into_iter()
            .filter(|p| {
                p.enabled
                    && p.name == name
                    && visible(p.visibility, p.team_id.as_deref(), p.owner_id.as_deref(), user)
            })
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::not_found(format!("prompt '{name}'")));
        }
        candidates.sort_by(|a, b| (&a.gateway_id, &a.id).cmp(&(&b.gateway_id, &b.id)));
        Ok(candidates.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_core::MemoryDao;
    use mcpgate_core::dao::Integration;

    fn tool(id: &str, name: &str, team: Option<&str>, visibility: Visibility) -> ToolRecord {
        ToolRecord {
            id: id.into(),
            gateway_id: Some("g1".into()),
            team_id: team.map(str::to_string),
            owner_id: None,
            name: name.into(),
            integration: Integration::Mcp {
                remote_name: name.into(),
            },
            schema: Value::Null,
            tags: Vec::new(),
            visibility,
            enabled: true,
            plugin_pre_chain: Vec::new(),
            plugin_post_chain: Vec::new(),
        }
    }

    fn user(team: &str) -> UserContext {
        let mut user = UserContext::anonymous();
        user.user_id = "u1".into();
        user.team_id = Some(team.into());
        user.teams = vec![team.into()];
        user
    }

    async fn catalog_with(tools: Vec<ToolRecord>) -> Catalog {
        let dao = Arc::new(MemoryDao::new());
        for tool in tools {
            dao.upsert_tool(tool).await.unwrap();
        }
        Catalog::new(dao)
    }

    #[tokio::test]
    async fn team_visibility_hides_other_teams() {
        let catalog = catalog_with(vec![
            tool("t1", "alpha", Some("eng"), Visibility::Team),
            tool("t2", "beta", Some("sales"), Visibility::Team),
            tool("t3", "gamma", Some("sales"), Visibility::Public),
        ])
        .await;

        let listed = catalog.list_tools(&user("eng"), Page::default()).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn private_tools_require_matching_owner() {
        let mut private = tool("t1", "secret", Some("eng"), Visibility::Private);
        private.owner_id = Some("u1".into());
        let catalog = catalog_with(vec![private]).await;

        assert!(catalog.resolve_tool("secret", &user("eng")).await.is_ok());

        let mut stranger = user("eng");
        stranger.user_id = "u2".into();
        let err = catalog.resolve_tool("secret", &stranger).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }

    #[tokio::test]
    async fn disabled_tools_are_invisible() {
        let mut t = tool("t1", "off", None, Visibility::Public);
        t.enabled = false;
        let catalog = catalog_with(vec![t]).await;
        let err = catalog.resolve_tool("off", &user("eng")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }

    #[tokio::test]
    async fn name_resolution_prefers_own_team_deterministically() {
        let catalog = catalog_with(vec![
            tool("t2", "echo", Some("sales"), Visibility::Public),
            tool("t1", "echo", Some("eng"), Visibility::Team),
        ])
        .await;

        let record = catalog.resolve_tool("echo", &user("eng")).await.unwrap();
        assert_eq!(record.id, "t1");

        // A caller outside both teams gets the stable first public record.
        let record = catalog.resolve_tool("echo", &user("ops")).await.unwrap();
        assert_eq!(record.id, "t2");
    }

    #[tokio::test]
    async fn pagination_is_stable() {
        let catalog = catalog_with(vec![
            tool("t1", "a", Some("eng"), Visibility::Public),
            tool("t2", "b", Some("eng"), Visibility::Public),
            tool("t3", "c", Some("eng"), Visibility::Public),
        ])
        .await;

        let page1 = catalog
            .list_tools(&user("eng"), Page { page: 1, per_page: 2 })
            .await
            .unwrap();
        let page2 = catalog
            .list_tools(&user("eng"), Page { page: 2, per_page: 2 })
            .await
            .unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 1);
        assert_eq!(page1[0]["name"], "a");
        assert_eq!(page2[0]["name"], "c");
    }
}
