// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use futures_util::StreamExt;
use scintilla::db;
use scintilla::db::sources::{CacheStatus, NewSource, set_cache_status};
use scintilla::db::tool_cache::{DiscoveredTool, replace_tools};
use scintilla::providers::base::{
    ChatRequest, LLMProvider, LLMResponse, Message, ToolCallRequest, ToolDefinition,
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Scripted LLM provider: pops one canned response per `chat` call and
/// records what it was asked.
pub struct MockProvider {
    responses: Mutex<VecDeque<LLMResponse>>,
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
    default_content: String,
}

impl MockProvider {
    pub fn with_responses(responses: Vec<LLMResponse>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            calls: Arc::new(Mutex::new(Vec::new())),
            default_content: "Mock response".to_string(),
        }
    }

    pub fn text(content: &str) -> LLMResponse {
        LLMResponse::text(content)
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> LLMResponse {
        LLMResponse {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            input_tokens: None,
            output_tokens: None,
        }
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: req.messages,
            model: req.model.map(str::to_string),
            tools: req.tools,
        });
        let response = self.responses.lock().unwrap().pop_front();
        Ok(response.unwrap_or_else(|| LLMResponse::text(self.default_content.clone())))
    }

    fn default_model(&self) -> &str {
        "claude-sonnet-4-20250514"
    }

    fn fast_model(&self) -> &str {
        "mock-fast-model"
    }
}

/// Fresh in-memory database with the schema applied. A single connection
/// keeps all pool users on the same in-memory instance.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    db::init_schema(&pool).await.expect("schema");
    pool
}

/// Seed an active source owned by `user` and mark its catalog cached with
/// the given tools.
pub async fn seed_cached_source(
    pool: &SqlitePool,
    user: Uuid,
    name: &str,
    server_url: &str,
    tools: &[(&str, Value)],
) -> Uuid {
    let source_id = scintilla::db::sources::create_source(
        pool,
        NewSource {
            name: name.to_string(),
            server_url: server_url.to_string(),
            auth_headers: HashMap::new(),
            owner_user_id: Some(user),
            owner_bot_id: None,
            instructions: None,
            is_public: false,
        },
    )
    .await
    .expect("create source");

    let discovered: Vec<DiscoveredTool> = tools
        .iter()
        .map(|(tool_name, schema)| DiscoveredTool {
            name: (*tool_name).to_string(),
            description: Some(format!("{tool_name} tool")),
            schema: Some(schema.clone()),
        })
        .collect();
    replace_tools(pool, source_id, &discovered).await.expect("cache tools");
    set_cache_status(pool, source_id, CacheStatus::Cached, None)
        .await
        .expect("set cached");

    source_id
}

#[derive(Clone)]
struct MockMcpState {
    tools: Arc<Vec<Value>>,
    call_results: Arc<HashMap<String, Value>>,
    conn: Arc<Mutex<Option<mpsc::Sender<Value>>>>,
    seen_headers: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

/// An in-process MCP server speaking the legacy HTTP+SSE transport:
/// GET /sse announces the message endpoint and streams JSON-RPC responses,
/// POST /messages accepts requests. Records every request's headers so
/// tests can assert auth propagation.
pub struct MockMcpServer {
    pub base_url: String,
    seen_headers: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl MockMcpServer {
    /// Headers observed across all requests, lowercased names.
    pub fn seen_headers(&self) -> Vec<HashMap<String, String>> {
        self.seen_headers.lock().unwrap().clone()
    }
}

fn record_headers(store: &Mutex<Vec<HashMap<String, String>>>, headers: &HeaderMap) {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_lowercase(), v.to_string());
        }
    }
    store.lock().unwrap().push(map);
}

async fn sse_handler(
    State(state): State<MockMcpState>,
    headers: HeaderMap,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    record_headers(&state.seen_headers, &headers);

    let (tx, rx) = mpsc::channel::<Value>(16);
    *state.conn.lock().unwrap() = Some(tx);

    let endpoint = futures_util::stream::once(async {
        Ok(Event::default()
            .event("endpoint")
            .data("/messages?session=test"))
    });
    let responses = ReceiverStream::new(rx)
        .map(|response| Ok(Event::default().event("message").data(response.to_string())));

    Sse::new(endpoint.chain(responses))
}

async fn messages_handler(
    State(state): State<MockMcpState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    record_headers(&state.seen_headers, &headers);

    // Notifications carry no id and get no response.
    let Some(id) = body.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };

    let result = match body["method"].as_str().unwrap_or("") {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "serverInfo": {"name": "mock-mcp", "version": "0.0.0"},
        }),
        "tools/list" => json!({"tools": &*state.tools}),
        "tools/call" => {
            let name = body["params"]["name"].as_str().unwrap_or("");
            state.call_results.get(name).cloned().unwrap_or_else(|| {
                json!({
                    "content": [{"type": "text", "text": format!("unknown tool {name}")}],
                    "isError": true,
                })
            })
        }
        _ => json!({}),
    };

    let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
    if let Some(tx) = state.conn.lock().unwrap().clone() {
        let _ = tx.try_send(response);
    }
    StatusCode::ACCEPTED
}

/// Start a mock MCP server on an ephemeral port.
pub async fn spawn_mock_mcp(
    tools: Vec<Value>,
    call_results: HashMap<String, Value>,
) -> MockMcpServer {
    let seen_headers = Arc::new(Mutex::new(Vec::new()));
    let state = MockMcpState {
        tools: Arc::new(tools),
        call_results: Arc::new(call_results),
        conn: Arc::new(Mutex::new(None)),
        seen_headers: seen_headers.clone(),
    };

    let app = axum::Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock mcp");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockMcpServer {
        base_url: format!("http://{addr}"),
        seen_headers,
    }
}

/// A text-content MCP tool result payload.
pub fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}
