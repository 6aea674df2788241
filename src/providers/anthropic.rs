use crate::providers::base::{
    ChatRequest, LLMProvider, LLMResponse, Message, ToolCallRequest, ToolDefinition,
};
use crate::providers::check_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const FAST_MODEL: &str = "claude-3-5-haiku-20241022";

pub struct AnthropicProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, default_model: Option<String>) -> Self {
        Self {
            api_key,
            default_model: default_model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: API_URL.to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: String, base_url: String) -> Self {
        let mut p = Self::new(api_key, None);
        p.base_url = base_url;
        p
    }
}

/// Convert generic messages to Anthropic API format.
/// Returns (`system_prompt`, `anthropic_messages`).
fn convert_messages(messages: Vec<Message>) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content),
            "user" => out.push(json!({"role": "user", "content": msg.content})),
            "assistant" => {
                let mut content: Vec<Value> = Vec::new();
                // Anthropic rejects empty text content blocks
                if !msg.content.is_empty() {
                    content.push(json!({"type": "text", "text": msg.content}));
                }
                if let Some(tool_calls) = msg.tool_calls {
                    for tc in tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments
                        }));
                    }
                }
                out.push(json!({"role": "assistant", "content": content}));
            }
            "tool" => {
                if let Some(tool_call_id) = msg.tool_call_id {
                    let mut result = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": msg.content
                    });
                    if msg.is_error {
                        result["is_error"] = json!(true);
                    }
                    out.push(json!({"role": "user", "content": [result]}));
                }
            }
            _ => {}
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    // Merge consecutive user messages (the API rejects consecutive same-role
    // messages; tool results each land as role "user").
    let mut merged: Vec<Value> = Vec::new();
    for msg in out {
        if let Some(last) = merged.last_mut()
            && last["role"] == "user"
            && msg["role"] == "user"
        {
            let mut combined = as_content_blocks(&last["content"]);
            combined.extend(as_content_blocks(&msg["content"]));
            last["content"] = Value::Array(combined);
            continue;
        }
        merged.push(msg);
    }

    (system, merged)
}

fn as_content_blocks(content: &Value) -> Vec<Value> {
    match content {
        Value::Array(arr) => arr.clone(),
        Value::String(s) => vec![json!({"type": "text", "text": s})],
        other => vec![other.clone()],
    }
}

fn convert_tools(tools: Vec<ToolDefinition>) -> Vec<Value> {
    tools
        .into_iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

fn parse_response(json: &Value) -> LLMResponse {
    let mut content = None;
    let mut tool_calls = Vec::new();

    if let Some(blocks) = json["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if content.is_none() {
                        content = block["text"].as_str().map(str::to_string);
                    }
                }
                Some("tool_use") => tool_calls.push(ToolCallRequest {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                }),
                _ => {}
            }
        }
    }

    let usage = json.get("usage");
    LLMResponse {
        content,
        tool_calls,
        input_tokens: usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64),
        output_tokens: usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64),
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<LLMResponse> {
        let (system, messages) = convert_messages(req.messages);

        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        if let Some(system) = system {
            payload["system"] = json!(system);
        }

        if let Some(tools) = req.tools {
            payload["tools"] = json!(convert_tools(tools));
            payload["tool_choice"] = json!({"type": "auto"});
        }

        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let json = check_response(resp, "Anthropic").await?;
        Ok(parse_response(&json))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn fast_model(&self) -> &str {
        FAST_MODEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_splits_system_from_messages() {
        let (system, messages) = convert_messages(vec![
            Message::system("be helpful"),
            Message::user("hello"),
        ]);
        assert_eq!(system.as_deref(), Some("be helpful"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn tool_results_become_user_messages_and_merge() {
        let calls = vec![
            ToolCallRequest {
                id: "a".into(),
                name: "search".into(),
                arguments: json!({}),
            },
            ToolCallRequest {
                id: "b".into(),
                name: "search".into(),
                arguments: json!({}),
            },
        ];
        let (_, messages) = convert_messages(vec![
            Message::user("q"),
            Message::assistant("", Some(calls)),
            Message::tool_result("a", "one", false),
            Message::tool_result("b", "two", true),
        ]);
        // user, assistant, merged tool-result user message
        assert_eq!(messages.len(), 3);
        let blocks = messages[2]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["tool_use_id"], "a");
        assert_eq!(blocks[1]["is_error"], json!(true));
    }

    #[test]
    fn empty_assistant_text_block_is_omitted() {
        let (_, messages) = convert_messages(vec![Message::assistant(
            "",
            Some(vec![ToolCallRequest {
                id: "x".into(),
                name: "t".into(),
                arguments: json!({"q": 1}),
            }]),
        )]);
        let blocks = messages[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "tool_use");
    }

    #[test]
    fn parse_response_extracts_text_and_tool_calls() {
        let body = json!({
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "tu_1", "name": "jira_search", "input": {"jql": "x"}}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let resp = parse_response(&body);
        assert_eq!(resp.content.as_deref(), Some("let me check"));
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "jira_search");
        assert_eq!(resp.input_tokens, Some(10));
    }

    #[test]
    fn with_base_url_overrides_endpoint() {
        let p = AnthropicProvider::with_base_url("k".into(), "http://localhost:1/v1".into());
        assert_eq!(p.base_url, "http://localhost:1/v1");
        assert_eq!(p.default_model(), DEFAULT_MODEL);
    }
}
