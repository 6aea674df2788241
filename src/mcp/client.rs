use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::errors::ScintillaError;
use crate::mcp::protocol::{self, McpToolDef};
use crate::mcp::sse::{SseEvent, SseParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CALL_RETRIES: u32 = 3;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const TEST_TOOL_PREVIEW: usize = 10;

/// Normalize a source's connection settings into `(sse_url, headers)`.
///
/// An `x-api-key` query parameter is promoted to a request header and
/// stripped from the URL (stored headers are ignored in that branch, so at
/// most one auth mechanism reaches the wire); otherwise the stored headers
/// pass through verbatim. Both branches force the path to end with `/sse`.
pub fn normalize_connection(
    server_url: &str,
    auth_headers: &HashMap<String, String>,
) -> Result<(String, HashMap<String, String>)> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server URL: {server_url}"))?;

    let mut headers = HashMap::new();
    let api_key = url
        .query_pairs()
        .find(|(k, _)| k == "x-api-key")
        .map(|(_, v)| v.into_owned());

    if let Some(key) = api_key {
        headers.insert("x-api-key".to_string(), key);
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "x-api-key")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.set_query(None);
        if !remaining.is_empty() {
            url.query_pairs_mut().extend_pairs(remaining);
        }
    } else {
        headers.extend(auth_headers.clone());
    }

    if !url.path().ends_with("/sse") {
        let path = format!("{}/sse", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }

    Ok((url.to_string(), headers))
}

fn transport_error(message: impl Into<String>) -> ScintillaError {
    ScintillaError::Transport {
        message: message.into(),
        retryable: true,
    }
}

/// One MCP session over the legacy HTTP+SSE transport: a long-lived GET
/// stream delivering events, and a message endpoint taking JSON-RPC POSTs.
/// Dropping the connection aborts the reader and closes the stream.
struct McpConnection {
    http: Client,
    headers: HashMap<String, String>,
    message_url: String,
    events: mpsc::Receiver<SseEvent>,
    next_id: u64,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl McpConnection {
    async fn open(http: &Client, sse_url: &str, headers: &HashMap<String, String>) -> Result<Self> {
        let mut req = http
            .get(sse_url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(format!("SSE connect failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(transport_error(format!(
                "SSE connect failed with status {}",
                resp.status()
            ))
            .into());
        }

        let (tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut stream = resp.bytes_stream();
        let reader = tokio::spawn(async move {
            let mut parser = SseParser::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                for event in parser.push(&chunk) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        // The server's first event announces the message-POST endpoint.
        let endpoint = loop {
            match events.recv().await {
                Some(ev) if ev.event_type.as_deref() == Some("endpoint") => break ev.data,
                Some(_) => continue,
                None => {
                    reader.abort();
                    return Err(transport_error("SSE stream closed before endpoint event").into());
                }
            }
        };

        let message_url = if endpoint.starts_with("http") {
            endpoint
        } else {
            Url::parse(sse_url)?
                .join(&endpoint)
                .with_context(|| format!("invalid message endpoint: {endpoint}"))?
                .to_string()
        };
        debug!("MCP session established, message endpoint: {}", message_url);

        Ok(Self {
            http: http.clone(),
            headers: headers.clone(),
            message_url,
            events,
            next_id: 0,
            reader,
        })
    }

    async fn post(&self, body: &Value) -> Result<()> {
        let mut req = self.http.post(&self.message_url).json(body);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(format!("message POST failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(transport_error(format!(
                "message POST failed with status {}",
                resp.status()
            ))
            .into());
        }
        Ok(())
    }

    /// Send one JSON-RPC request and wait for the matching response on the
    /// event stream. Server-signaled errors surface as `McpServer`.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        self.post(&protocol::request(id, method, params)).await?;

        loop {
            let Some(event) = self.events.recv().await else {
                return Err(transport_error("SSE stream closed awaiting response").into());
            };
            let Ok(msg) = serde_json::from_str::<Value>(&event.data) else {
                continue;
            };
            if msg.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = msg.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown MCP error");
                return Err(ScintillaError::McpServer(message.to_string()).into());
            }
            return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        self.request("initialize", protocol::initialize_params())
            .await?;
        self.post(&protocol::notification("notifications/initialized"))
            .await
    }
}

/// Result of an SSE connection test, surfaced by the management API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    pub tool_count: usize,
    pub response_time_ms: u64,
    pub tools: Vec<String>,
}

/// Client for remote MCP servers over SSE. Holds no per-server state —
/// every operation opens a short-lived session and closes it on drop.
#[derive(Clone)]
pub struct McpClient {
    http: Client,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    async fn session_tools(
        &self,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
    ) -> Result<Vec<McpToolDef>> {
        let (sse_url, headers) = normalize_connection(server_url, auth_headers)?;
        let mut conn = McpConnection::open(&self.http, &sse_url, &headers).await?;
        conn.initialize().await?;
        let result = conn.request("tools/list", json!({})).await?;
        Ok(protocol::parse_tool_list(&result))
    }

    /// Open a session, initialize, list tools, and report how it went.
    /// Never errors — failures land in the response value.
    pub async fn test_connection(
        &self,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
    ) -> ConnectionTest {
        let started = Instant::now();
        match tokio::time::timeout(TEST_TIMEOUT, self.session_tools(server_url, auth_headers)).await
        {
            Ok(Ok(tools)) => ConnectionTest {
                success: true,
                message: "Connection successful".to_string(),
                tool_count: tools.len(),
                response_time_ms: started.elapsed().as_millis() as u64,
                tools: tools
                    .iter()
                    .take(TEST_TOOL_PREVIEW)
                    .map(|t| t.name.clone())
                    .collect(),
            },
            Ok(Err(e)) => ConnectionTest {
                success: false,
                message: format!("Connection failed: {e}"),
                tool_count: 0,
                response_time_ms: started.elapsed().as_millis() as u64,
                tools: Vec::new(),
            },
            Err(_) => ConnectionTest {
                success: false,
                message: format!("Connection timed out after {} seconds", TEST_TIMEOUT.as_secs()),
                tool_count: 0,
                response_time_ms: started.elapsed().as_millis() as u64,
                tools: Vec::new(),
            },
        }
    }

    /// Discover the server's tool catalog (30s budget, no retries).
    pub async fn list_tools(
        &self,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
    ) -> Result<Vec<McpToolDef>> {
        tokio::time::timeout(DISCOVERY_TIMEOUT, self.session_tools(server_url, auth_headers))
            .await
            .map_err(|_| {
                transport_error(format!(
                    "tool discovery timed out after {} seconds",
                    DISCOVERY_TIMEOUT.as_secs()
                ))
            })?
    }

    async fn call_once(
        &self,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<String> {
        let (sse_url, headers) = normalize_connection(server_url, auth_headers)?;
        let mut conn = McpConnection::open(&self.http, &sse_url, &headers).await?;
        conn.initialize().await?;
        let result = conn
            .request(
                "tools/call",
                json!({"name": tool_name, "arguments": arguments}),
            )
            .await?;
        let (text, is_error) = protocol::flatten_call_result(&result);
        if is_error {
            return Err(ScintillaError::McpServer(text).into());
        }
        Ok(text)
    }

    /// Invoke a tool with up to three retries on transport failures and
    /// timeouts, sleeping `min(attempt * 0.5s, 2s)` between attempts.
    /// Structured MCP errors are returned immediately.
    pub async fn call_tool(
        &self,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..=MAX_CALL_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis((attempt as u64 * 500).min(2000));
                warn!(
                    "retrying tool call '{}' (attempt {}/{}) after {:?}",
                    tool_name, attempt, MAX_CALL_RETRIES, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(
                CALL_TIMEOUT,
                self.call_once(server_url, auth_headers, tool_name, arguments),
            )
            .await
            {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => {
                    let retryable = e
                        .downcast_ref::<ScintillaError>()
                        .is_none_or(ScintillaError::is_retryable);
                    if !retryable {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
                Err(_) => {
                    last_error = Some(
                        transport_error(format!(
                            "tool call timed out after {} seconds",
                            CALL_TIMEOUT.as_secs()
                        ))
                        .into(),
                    );
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            transport_error(format!(
                "tool call failed after {} attempts",
                MAX_CALL_RETRIES + 1
            ))
            .into()
        }))
    }
}
