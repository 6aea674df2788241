mod common;

use common::test_pool;
use scintilla::config::{BrokerConfig, ProviderConfig, ProvidersConfig};
use scintilla::db::agent_tokens;
use scintilla::gateway::{AppState, build_router};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use uuid::Uuid;

async fn spawn_server(pool: SqlitePool) -> String {
    let providers = ProvidersConfig {
        anthropic: ProviderConfig {
            api_key: Some("test-key".to_string()),
            model: None,
        },
        openai: ProviderConfig::default(),
    };
    let state = AppState::new(pool, providers, BrokerConfig::default());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn register_requires_agent_token() {
    let pool = test_pool().await;
    let base = spawn_server(pool).await;
    let client = reqwest::Client::new();

    let body = json!({
        "agent_id": "a1",
        "name": "proxy",
        "capabilities": ["jira_operations"],
    });

    let resp = client
        .post(format!("{base}/agents/register"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let error: Value = resp.json().await.unwrap();
    assert_eq!(error["success"], json!(false));

    let resp = client
        .post(format!("{base}/agents/register"))
        .bearer_auth("scat_not_a_real_token")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn register_poll_and_status_round_trip() {
    let pool = test_pool().await;
    let token = agent_tokens::create_token(&pool, Uuid::new_v4(), Some("test"), None)
        .await
        .unwrap();
    let base = spawn_server(pool).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/agents/register"))
        .bearer_auth(&token)
        .json(&json!({
            "agent_id": "a1",
            "name": "proxy",
            "capabilities": ["jira_operations"],
            "version": "1.0",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["agent_id"], "a1");

    // Nothing queued yet.
    let resp: Value = client
        .post(format!("{base}/agents/poll/a1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["has_work"], json!(false));

    let status: Value = client
        .get(format!("{base}/agents/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["registered_agents"], json!(1));
    assert_eq!(status["agents"][0]["agent_id"], "a1");
    assert_eq!(status["pending_tasks"], json!(0));
}

#[tokio::test]
async fn refresh_tools_round_trip_through_polling_agent() {
    let pool = test_pool().await;
    let token = agent_tokens::create_token(&pool, Uuid::new_v4(), None, None)
        .await
        .unwrap();
    let base = spawn_server(pool).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/agents/register"))
        .bearer_auth(&token)
        .json(&json!({
            "agent_id": "a1",
            "name": "proxy",
            "capabilities": ["khoros-atlassian"],
        }))
        .send()
        .await
        .unwrap();

    // Kick off the refresh; it blocks until the agent reports tools.
    let refresh = {
        let client = client.clone();
        let base = base.clone();
        let token = token.clone();
        tokio::spawn(async move {
            client
                .post(format!("{base}/agents/refresh-tools"))
                .bearer_auth(&token)
                .json(&json!({"agent_id": "a1", "capability": "khoros-atlassian"}))
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        })
    };

    // Play the polling agent over HTTP until the discovery task shows up.
    let task_id = loop {
        let poll: Value = client
            .post(format!("{base}/agents/poll/a1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if poll["has_work"] == json!(true) {
            assert_eq!(poll["task"]["tool_name"], "__discovery__");
            assert_eq!(poll["task"]["arguments"]["capability"], "khoros-atlassian");
            break poll["task"]["task_id"].as_str().unwrap().to_string();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };

    let resp = client
        .post(format!("{base}/agents/results/{task_id}"))
        .bearer_auth(&token)
        .json(&json!({
            "task_id": task_id,
            "agent_id": "a1",
            "success": true,
            "result": {"tools": [{"name": "jira_search"}]},
            "execution_time_ms": 7,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let outcome = refresh.await.unwrap();
    assert_eq!(outcome["success"], json!(true), "{outcome}");
    assert_eq!(outcome["tools_discovered"], json!(1));
    assert_eq!(outcome["capability"], "khoros-atlassian");
}

#[tokio::test]
async fn refresh_tools_unknown_agent_is_404() {
    let pool = test_pool().await;
    let token = agent_tokens::create_token(&pool, Uuid::new_v4(), None, None)
        .await
        .unwrap();
    let base = spawn_server(pool).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/agents/refresh-tools"))
        .bearer_auth(&token)
        .json(&json!({"agent_id": "ghost", "capability": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn execute_endpoint_times_out_without_agents() {
    let pool = test_pool().await;
    let base = spawn_server(pool).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{base}/agents/execute"))
        .json(&json!({"tool_name": "jira_search", "arguments": {}, "timeout_seconds": 1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn query_with_no_sources_streams_fallback_final_response() {
    let pool = test_pool().await;
    let base = spawn_server(pool).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/query"))
        .json(&json!({"message": "hello there"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    let events: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "final_response");
    assert!(
        events[0]["content"]
            .as_str()
            .unwrap()
            .contains("tools configured")
    );
    assert_eq!(events[0]["processing_stats"]["total_tools_called"], json!(0));
}
