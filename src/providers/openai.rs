use crate::providers::base::{
    ChatRequest, LLMProvider, LLMResponse, Message, ToolCallRequest, ToolDefinition,
};
use crate::providers::check_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MODEL: &str = "gpt-4o";
const FAST_MODEL: &str = "gpt-4o-mini";

pub struct OpenAIProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(api_key: String, default_model: Option<String>) -> Self {
        Self {
            api_key,
            default_model: default_model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: API_URL.to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
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

fn convert_messages(messages: Vec<Message>) -> Vec<Value> {
    messages
        .into_iter()
        .map(|msg| {
            let mut m = json!({
                "role": msg.role,
                "content": msg.content,
            });
            if let Some(tool_calls) = msg.tool_calls {
                m["tool_calls"] = json!(
                    tool_calls
                        .into_iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect::<Vec<_>>()
                );
            }
            if let Some(tool_call_id) = msg.tool_call_id {
                m["tool_call_id"] = json!(tool_call_id);
            }
            m
        })
        .collect()
}

fn convert_tools(tools: Vec<ToolDefinition>) -> Vec<Value> {
    tools
        .into_iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn parse_response(json: &Value) -> Result<LLMResponse> {
    let choice = json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .context("No choices in OpenAI response")?;

    let message = &choice["message"];
    let content = message["content"].as_str().map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(tool_calls_array) = message["tool_calls"].as_array() {
        for tc in tool_calls_array {
            if let Some(function) = tc["function"].as_object() {
                let arguments = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_else(|| json!({}));

                tool_calls.push(ToolCallRequest {
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    name: function
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    arguments,
                });
            }
        }
    }

    let usage = json.get("usage");
    Ok(LLMResponse {
        content,
        tool_calls,
        input_tokens: usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(Value::as_u64),
        output_tokens: usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(Value::as_u64),
    })
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<LLMResponse> {
        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": convert_messages(req.messages),
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        if let Some(tools) = req.tools {
            payload["tools"] = json!(convert_tools(tools));
            payload["tool_choice"] = json!("auto");
        }

        let resp = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        let json = check_response(resp, "OpenAI").await?;
        parse_response(&json)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn fast_model(&self) -> &str {
        FAST_MODEL
    }
}
