use anyhow::Result;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{DISCOVERY_TOOL, LocalAgentBroker};
use crate::db::sources::{self, CacheStatus, NewSource, Source};
use crate::db::tool_cache::{self, DiscoveredTool, SourceTool};
use crate::errors::ScintillaError;
use crate::mcp::McpClient;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one catalog refresh. Operational failures (unreachable
/// server, no capable agent) land here with `success = false`; only
/// storage-level problems propagate as errors.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub success: bool,
    pub message: String,
    pub tools_discovered: usize,
}

impl RefreshOutcome {
    fn ok(count: usize) -> Self {
        Self {
            success: true,
            message: format!("Successfully cached {count} tools"),
            tools_discovered: count,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            tools_discovered: 0,
        }
    }
}

/// Extract the capability tail of a local source URL
/// (`local://cap`, `agent://cap`, `stdio://path`).
pub fn local_capability(server_url: &str) -> Option<&str> {
    for scheme in ["local://", "stdio://", "agent://"] {
        if let Some(rest) = server_url.strip_prefix(scheme) {
            return Some(rest.trim_matches('/')).filter(|s| !s.is_empty());
        }
    }
    None
}

/// Discovers tools per source and maintains the persistent cache; answers
/// "which tools?" for the agent loop straight from that cache.
pub struct ToolCatalog {
    pool: SqlitePool,
    mcp: McpClient,
    broker: Arc<LocalAgentBroker>,
}

impl ToolCatalog {
    pub fn new(pool: SqlitePool, mcp: McpClient, broker: Arc<LocalAgentBroker>) -> Self {
        Self { pool, mcp, broker }
    }

    /// Refresh one source's catalog. Sets `cache_status` to `caching` for
    /// the duration and leaves it at `cached` or `error`.
    pub async fn refresh_source(&self, source_id: Uuid) -> Result<RefreshOutcome> {
        let auth = sources::get_source_auth(&self.pool, source_id)
            .await?
            .ok_or_else(|| ScintillaError::AuthMissing(source_id.to_string()))?;

        sources::set_cache_status(&self.pool, source_id, CacheStatus::Caching, None).await?;

        if let Some(capability) = local_capability(&auth.server_url) {
            let capability = capability.to_string();
            return self.refresh_from_agent(source_id, &capability).await;
        }

        self.refresh_remote(source_id, &auth.server_url, &auth.auth_headers)
            .await
    }

    async fn refresh_remote(
        &self,
        source_id: Uuid,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
    ) -> Result<RefreshOutcome> {
        let tools = match self.mcp.list_tools(server_url, auth_headers).await {
            Ok(tools) => tools,
            Err(e) => {
                let message = format!("Tool discovery failed: {e}");
                warn!("source {}: {}", source_id, message);
                sources::set_cache_status(&self.pool, source_id, CacheStatus::Error, Some(&message))
                    .await?;
                return Ok(RefreshOutcome::failed(message));
            }
        };

        let discovered: Vec<DiscoveredTool> = tools
            .into_iter()
            .map(|t| DiscoveredTool {
                name: t.name,
                description: t.description,
                schema: t.input_schema,
            })
            .collect();

        self.persist(source_id, &discovered).await
    }

    /// The local discovery protocol: enqueue a `__discovery__` task for the
    /// capability and persist whatever the agent reports. Local catalogs
    /// are only populated by explicit refreshes, never at query time.
    async fn refresh_from_agent(
        &self,
        source_id: Uuid,
        capability: &str,
    ) -> Result<RefreshOutcome> {
        if !self.broker.has_capable_agent(capability) {
            let message = format!("No capable agent registered for capability '{capability}'");
            sources::set_cache_status(&self.pool, source_id, CacheStatus::Error, Some(&message))
                .await?;
            return Ok(RefreshOutcome::failed(message));
        }

        let result = self
            .broker
            .execute(
                DISCOVERY_TOOL,
                json!({"capability": capability}),
                DISCOVERY_TIMEOUT,
            )
            .await;

        let payload = match result {
            Some(result) if result.success => result.result.unwrap_or(Value::Null),
            Some(result) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "Tool discovery failed".to_string());
                sources::set_cache_status(&self.pool, source_id, CacheStatus::Error, Some(&message))
                    .await?;
                return Ok(RefreshOutcome::failed(message));
            }
            None => {
                let message = "Tool discovery timed out".to_string();
                sources::set_cache_status(&self.pool, source_id, CacheStatus::Error, Some(&message))
                    .await?;
                return Ok(RefreshOutcome::failed(message));
            }
        };

        let discovered = match parse_discovery_payload(&payload) {
            Ok(tools) => tools,
            Err(e) => {
                let message = format!("Failed to parse agent response: {e}");
                sources::set_cache_status(&self.pool, source_id, CacheStatus::Error, Some(&message))
                    .await?;
                return Ok(RefreshOutcome::failed(message));
            }
        };

        self.persist(source_id, &discovered).await
    }

    async fn persist(
        &self,
        source_id: Uuid,
        discovered: &[DiscoveredTool],
    ) -> Result<RefreshOutcome> {
        let count = tool_cache::replace_tools(&self.pool, source_id, discovered).await?;
        sources::set_cache_status(&self.pool, source_id, CacheStatus::Cached, None).await?;
        info!("source {}: cached {} tools", source_id, count);
        Ok(RefreshOutcome::ok(count))
    }

    /// Refresh the catalog behind a local capability on behalf of a user:
    /// verifies the named agent actually declares the capability, reuses or
    /// creates the `local://<capability>` source, and runs the discovery
    /// flow against it.
    pub async fn refresh_local_capability(
        &self,
        user_id: Uuid,
        agent_id: &str,
        capability: &str,
    ) -> Result<RefreshOutcome> {
        let Some(capabilities) = self.broker.agent_capabilities(agent_id) else {
            return Ok(RefreshOutcome::failed(format!("Agent {agent_id} not found")));
        };
        if !capabilities.iter().any(|c| c == capability) {
            return Ok(RefreshOutcome::failed(format!(
                "Agent {agent_id} does not have capability '{capability}'"
            )));
        }

        let server_url = format!("local://{capability}");
        let source_id = match sources::find_by_server_url(&self.pool, &server_url).await? {
            Some(source) => source.source_id,
            None => {
                sources::create_source(
                    &self.pool,
                    NewSource {
                        name: format!("Local {capability}"),
                        server_url,
                        auth_headers: HashMap::new(),
                        owner_user_id: Some(user_id),
                        owner_bot_id: None,
                        instructions: None,
                        is_public: false,
                    },
                )
                .await?
            }
        };

        self.refresh_source(source_id).await
    }

    /// Read-path for the agent loop: cached tools of active, cached sources.
    pub async fn load_tools(&self, source_ids: &[Uuid]) -> Result<Vec<SourceTool>> {
        tool_cache::load_tools_for_sources(&self.pool, source_ids).await
    }

    /// Resolve the effective source set for a query: specific sources with
    /// access check, plus everything bundled by the selected bots.
    pub async fn resolve_sources(
        &self,
        user_id: Uuid,
        selected_sources: &[Uuid],
        selected_bots: &[Uuid],
    ) -> Result<Vec<Source>> {
        let bot_sources = crate::db::bots::bot_source_ids(&self.pool, selected_bots).await?;
        let mut all_ids: Vec<Uuid> = selected_sources.to_vec();
        for id in bot_sources {
            if !all_ids.contains(&id) {
                all_ids.push(id);
            }
        }
        sources::list_specific_sources(&self.pool, user_id, &all_ids).await
    }
}

/// Decode a discovery payload: `{tools: [{name, description?, inputSchema?}]}`,
/// JSON-decoding string payloads first if needed.
fn parse_discovery_payload(payload: &Value) -> Result<Vec<DiscoveredTool>> {
    let decoded;
    let object = match payload {
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s)?;
            &decoded
        }
        other => other,
    };

    let tools = object
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("expected object with a 'tools' array"))?;

    Ok(tools
        .iter()
        .filter_map(|t| {
            let name = t.get("name").and_then(Value::as_str)?;
            Some(DiscoveredTool {
                name: name.to_string(),
                description: t
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                schema: t.get("inputSchema").cloned(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_extraction() {
        assert_eq!(local_capability("local://khoros-atlassian"), Some("khoros-atlassian"));
        assert_eq!(local_capability("agent://jira_operations"), Some("jira_operations"));
        assert_eq!(local_capability("stdio://opt/mcp/server"), Some("opt/mcp/server"));
        assert_eq!(local_capability("https://example.com/sse"), None);
        assert_eq!(local_capability("local://"), None);
    }

    #[test]
    fn discovery_payload_accepts_objects_and_strings() {
        let object = json!({"tools": [{"name": "confluence_search", "description": "d"}]});
        let tools = parse_discovery_payload(&object).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "confluence_search");

        let string = Value::String(object.to_string());
        let tools = parse_discovery_payload(&string).unwrap();
        assert_eq!(tools.len(), 1);
    }

    #[test]
    fn discovery_payload_rejects_garbage() {
        assert!(parse_discovery_payload(&json!("not json at all")).is_err());
        assert!(parse_discovery_payload(&json!({"no_tools": []})).is_err());
        assert!(parse_discovery_payload(&json!(42)).is_err());
    }

    #[test]
    fn discovery_payload_skips_nameless_tools() {
        let payload = json!({"tools": [{"name": "ok"}, {"description": "nameless"}]});
        let tools = parse_discovery_payload(&payload).unwrap();
        assert_eq!(tools.len(), 1);
    }
}
