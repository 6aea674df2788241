use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::broker::{AgentRegistration, AgentTaskResult};
use crate::db::agent_tokens;
use crate::gateway::AppState;

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"success": false, "message": message.into()})),
    )
}

/// Resolve the agent bearer token (`Authorization: Bearer scat_…`) to its
/// owning user.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Uuid, (StatusCode, Json<Value>)> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "Missing agent token"))?;

    match agent_tokens::validate_token(&state.pool, token).await {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(error_body(StatusCode::UNAUTHORIZED, "Invalid agent token")),
        Err(e) => Err(error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Token validation failed: {e}"),
        )),
    }
}

/// POST /agents/register — idempotent registration of a local proxy agent.
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(registration): Json<AgentRegistration>,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, &headers).await {
        return e;
    }

    let agent_id = registration.agent_id.clone();
    let capabilities = registration.capabilities.clone();
    let name = registration.name.clone();
    state.broker.register(registration);

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("Agent '{name}' registered successfully"),
            "agent_id": agent_id,
            "capabilities": capabilities,
        })),
    )
}

/// POST /agents/poll/{agent_id} — hand out matching work, FIFO.
pub async fn poll(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    match state.broker.poll(&agent_id) {
        Some(task) => Json(json!({"has_work": true, "task": task})),
        None => Json(json!({"has_work": false, "task": null})),
    }
}

/// POST /agents/results/{task_id} — deliver a task's result.
pub async fn submit_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    headers: HeaderMap,
    Json(result): Json<AgentTaskResult>,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, &headers).await {
        return e;
    }

    state.broker.complete(task_id, result);
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Task result submitted successfully",
            "task_id": task_id,
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct ToolRefreshRequest {
    pub agent_id: String,
    pub capability: String,
}

#[derive(Debug, Serialize)]
pub struct ToolRefreshResponse {
    pub success: bool,
    pub message: String,
    pub tools_discovered: usize,
    pub capability: String,
    pub agent_id: String,
}

/// POST /agents/refresh-tools — run the local discovery flow for one
/// capability and cache what the agent reports.
pub async fn refresh_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ToolRefreshRequest>,
) -> impl IntoResponse {
    let user_id = match authenticate(&state, &headers).await {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };

    if !state.broker.is_registered(&request.agent_id) {
        return error_body(
            StatusCode::NOT_FOUND,
            format!("Agent {} not found", request.agent_id),
        )
        .into_response();
    }

    match state
        .catalog
        .refresh_local_capability(user_id, &request.agent_id, &request.capability)
        .await
    {
        Ok(outcome) => {
            info!(
                "tool refresh for '{}' via {}: {} ({} tools)",
                request.capability, request.agent_id, outcome.success, outcome.tools_discovered
            );
            Json(ToolRefreshResponse {
                success: outcome.success,
                message: outcome.message,
                tools_discovered: outcome.tools_discovered,
                capability: request.capability,
                agent_id: request.agent_id,
            })
            .into_response()
        }
        Err(e) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Tool refresh failed: {e}"),
        )
        .into_response(),
    }
}

/// GET /agents/status — snapshot of the local-agent system.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broker.status())
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// POST /agents/execute — submit a task and wait for its completion.
/// Primarily a diagnostic surface for operators and agent authors.
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let timeout = Duration::from_secs(
        request
            .timeout_seconds
            .unwrap_or(state.broker_config.default_task_timeout_seconds),
    );
    let arguments = if request.arguments.is_null() {
        json!({})
    } else {
        request.arguments
    };

    let task_id = state.broker.submit(&request.tool_name, arguments, timeout);
    match state.broker.wait(task_id, timeout).await {
        Some(result) => Json(json!({
            "success": result.success,
            "task_id": task_id,
            "result": result.result,
            "error": result.error,
        })),
        None => Json(json!({
            "success": false,
            "task_id": task_id,
            "error": "Task timed out or no capable agent available",
        })),
    }
}

#[derive(Debug, Deserialize)]
pub struct TestConnectionRequest {
    pub server_url: String,
    #[serde(default)]
    pub auth_headers: HashMap<String, String>,
}

/// POST /sources/test-connection — open an SSE session against a candidate
/// URL and report tool count and latency.
pub async fn test_connection(
    State(state): State<AppState>,
    Json(request): Json<TestConnectionRequest>,
) -> impl IntoResponse {
    Json(
        state
            .mcp
            .test_connection(&request.server_url, &request.auth_headers)
            .await,
    )
}
