use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::agent::{AgentLoop, QueryEvent, QueryRequest};
use crate::gateway::AppState;
use crate::providers::create_provider;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_PROVIDER: &str = "anthropic";

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub selected_sources: Vec<Uuid>,
    #[serde(default)]
    pub selected_bots: Vec<Uuid>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    /// The verified principal. Authentication itself lives outside the
    /// core; the caller is trusted to have established it.
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

/// POST /query — run the agent loop and stream typed events as SSE data
/// lines. The stream always ends with exactly one `final_response` or
/// `error` event; a dropped client cancels the loop via the closed channel.
pub async fn query_handler(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<QueryEvent>(EVENT_CHANNEL_CAPACITY);

    let provider_name = body
        .llm_provider
        .clone()
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

    match create_provider(&provider_name, &state.providers) {
        Ok(provider) => {
            let request = QueryRequest {
                message: body.message,
                user_id: body.user_id.unwrap_or_else(Uuid::nil),
                model: body.llm_model,
                conversation_id: body.conversation_id,
                selected_sources: body.selected_sources,
                selected_bots: body.selected_bots,
            };
            let agent_loop = AgentLoop::new(
                state.pool.clone(),
                state.catalog.clone(),
                state.executor.clone(),
            );
            tokio::spawn(async move {
                agent_loop.run(provider, request, tx).await;
            });
        }
        Err(e) => {
            tokio::spawn(async move {
                let _ = tx
                    .send(QueryEvent::Error {
                        error: e.to_string(),
                        details: None,
                    })
                    .await;
            });
        }
    }

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{\"type\":\"error\",\"error\":\"serialization failed\"}")))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_body_defaults() {
        let body: QueryBody = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(body.selected_sources.is_empty());
        assert!(body.selected_bots.is_empty());
        assert!(body.llm_provider.is_none());
        assert!(body.conversation_id.is_none());
    }

    #[test]
    fn query_body_parses_full_request() {
        let body: QueryBody = serde_json::from_str(
            r#"{
                "message": "show open tickets",
                "conversation_id": "0191d5a0-0000-7000-8000-000000000000",
                "selected_sources": ["0191d5a0-0000-7000-8000-000000000001"],
                "llm_provider": "anthropic",
                "llm_model": "claude-sonnet-4-20250514"
            }"#,
        )
        .unwrap();
        assert_eq!(body.selected_sources.len(), 1);
        assert_eq!(body.llm_provider.as_deref(), Some("anthropic"));
    }
}
