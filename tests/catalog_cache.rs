mod common;

use common::{spawn_mock_mcp, test_pool};
use scintilla::broker::{AgentRegistration, AgentTaskResult, DISCOVERY_TOOL, LocalAgentBroker};
use scintilla::catalog::ToolCatalog;
use scintilla::db::sources::{self, CacheStatus, NewSource};
use scintilla::db::tool_cache::load_tools_for_sources;
use scintilla::mcp::McpClient;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn catalog_with(pool: &SqlitePool) -> (Arc<LocalAgentBroker>, ToolCatalog) {
    let broker = Arc::new(LocalAgentBroker::new());
    let catalog = ToolCatalog::new(pool.clone(), McpClient::new(), broker.clone());
    (broker, catalog)
}

async fn seed_remote_source(pool: &SqlitePool, server_url: &str) -> Uuid {
    sources::create_source(
        pool,
        NewSource {
            name: "Remote".into(),
            server_url: server_url.into(),
            auth_headers: HashMap::new(),
            owner_user_id: Some(Uuid::new_v4()),
            owner_bot_id: None,
            instructions: None,
            is_public: false,
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn remote_refresh_caches_discovered_tools() {
    let pool = test_pool().await;
    let (_broker, catalog) = catalog_with(&pool).await;

    let server = spawn_mock_mcp(
        vec![
            json!({"name": "jira_search", "description": "Search issues", "inputSchema": {"type": "object", "properties": {"jql": {"type": "string"}}}}),
            json!({"name": "jira_get", "description": "Fetch one issue"}),
        ],
        HashMap::new(),
    )
    .await;

    let source_id = seed_remote_source(&pool, &format!("{}/sse", server.base_url)).await;
    let outcome = catalog.refresh_source(source_id).await.unwrap();
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.tools_discovered, 2);

    let source = sources::get_source(&pool, source_id).await.unwrap().unwrap();
    assert_eq!(source.cache_status, CacheStatus::Cached);
    assert!(source.cache_error.is_none());
    assert!(source.cache_last_refreshed_at.is_some());

    let tools = load_tools_for_sources(&pool, &[source_id]).await.unwrap();
    assert_eq!(tools.len(), 2);
    // A tool reported without a schema is cached with an empty object.
    let bare = tools.iter().find(|t| t.tool_name == "jira_get").unwrap();
    assert_eq!(bare.schema, json!({}));
}

#[tokio::test]
async fn refreshing_twice_yields_the_same_catalog() {
    let pool = test_pool().await;
    let (_broker, catalog) = catalog_with(&pool).await;

    let server = spawn_mock_mcp(
        vec![json!({"name": "jira_search", "description": "Search issues"})],
        HashMap::new(),
    )
    .await;

    let source_id = seed_remote_source(&pool, &format!("{}/sse", server.base_url)).await;
    catalog.refresh_source(source_id).await.unwrap();
    let first = load_tools_for_sources(&pool, &[source_id]).await.unwrap();

    catalog.refresh_source(source_id).await.unwrap();
    let second = load_tools_for_sources(&pool, &[source_id]).await.unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].tool_name, second[0].tool_name);
}

#[tokio::test]
async fn unreachable_server_marks_source_errored() {
    let pool = test_pool().await;
    let (_broker, catalog) = catalog_with(&pool).await;

    // Nothing listens on port 1.
    let source_id = seed_remote_source(&pool, "http://127.0.0.1:1/sse").await;
    let outcome = catalog.refresh_source(source_id).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.tools_discovered, 0);

    let source = sources::get_source(&pool, source_id).await.unwrap().unwrap();
    assert_eq!(source.cache_status, CacheStatus::Error);
    assert!(source.cache_error.is_some());
}

#[tokio::test]
async fn local_refresh_without_capable_agent_fails() {
    let pool = test_pool().await;
    let (_broker, catalog) = catalog_with(&pool).await;

    let source_id = seed_remote_source(&pool, "local://khoros-atlassian").await;
    let outcome = catalog.refresh_source(source_id).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.message.contains("No capable agent"));

    let source = sources::get_source(&pool, source_id).await.unwrap().unwrap();
    assert_eq!(source.cache_status, CacheStatus::Error);
}

#[tokio::test]
async fn local_refresh_requires_declared_capability() {
    let pool = test_pool().await;
    let (broker, catalog) = catalog_with(&pool).await;

    broker.register(AgentRegistration {
        agent_id: "a1".into(),
        name: "proxy".into(),
        capabilities: vec!["github_operations".into()],
        version: None,
    });

    let outcome = catalog
        .refresh_local_capability(Uuid::new_v4(), "a1", "khoros-atlassian")
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.message.contains("does not have capability"));
}

#[tokio::test]
async fn local_refresh_persists_agent_reported_tools() {
    let pool = test_pool().await;
    let (broker, catalog) = catalog_with(&pool).await;
    let user = Uuid::new_v4();

    broker.register(AgentRegistration {
        agent_id: "a1".into(),
        name: "proxy".into(),
        capabilities: vec!["khoros-atlassian".into()],
        version: None,
    });

    // Answer the discovery task with a string payload: it must be
    // JSON-decoded before persistence.
    let agent = {
        let broker = broker.clone();
        tokio::spawn(async move {
            loop {
                if let Some(task) = broker.poll("a1") {
                    assert_eq!(task.tool_name, DISCOVERY_TOOL);
                    broker.complete(
                        task.task_id,
                        AgentTaskResult {
                            task_id: task.task_id,
                            agent_id: "a1".into(),
                            success: true,
                            result: Some(json!(
                                r#"{"tools":[{"name":"jira_search"},{"name":"confluence_search"}]}"#
                            )),
                            error: None,
                            execution_time_ms: None,
                        },
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let outcome = catalog
        .refresh_local_capability(user, "a1", "khoros-atlassian")
        .await
        .unwrap();
    agent.await.unwrap();

    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.tools_discovered, 2);

    let source = sources::find_by_server_url(&pool, "local://khoros-atlassian")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source.cache_status, CacheStatus::Cached);
    let tools = load_tools_for_sources(&pool, &[source.source_id]).await.unwrap();
    assert_eq!(tools.len(), 2);
}

#[tokio::test]
async fn missing_source_surfaces_auth_missing() {
    let pool = test_pool().await;
    let (_broker, catalog) = catalog_with(&pool).await;
    assert!(catalog.refresh_source(Uuid::new_v4()).await.is_err());
}
