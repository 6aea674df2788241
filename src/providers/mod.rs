pub mod anthropic;
pub mod base;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use base::{ChatRequest, LLMProvider, LLMResponse, Message, ToolCallRequest, ToolDefinition};
pub use openai::OpenAIProvider;

use crate::config::ProvidersConfig;
use crate::errors::ScintillaError;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

/// Build a provider for the given name ("anthropic" or "openai"), using
/// credentials from config. Unknown names are a configuration error.
pub fn create_provider(name: &str, config: &ProvidersConfig) -> Result<Arc<dyn LLMProvider>> {
    match name {
        "anthropic" => {
            let api_key = config
                .anthropic
                .api_key
                .clone()
                .ok_or_else(|| ScintillaError::Config("ANTHROPIC_API_KEY not set".into()))?;
            Ok(Arc::new(AnthropicProvider::new(
                api_key,
                config.anthropic.model.clone(),
            )))
        }
        "openai" => {
            let api_key = config
                .openai
                .api_key
                .clone()
                .ok_or_else(|| ScintillaError::Config("OPENAI_API_KEY not set".into()))?;
            Ok(Arc::new(OpenAIProvider::new(
                api_key,
                config.openai.model.clone(),
            )))
        }
        other => Err(ScintillaError::Config(format!("unsupported LLM provider: {other}")).into()),
    }
}

/// Check an HTTP response from a provider API, returning the parsed JSON body
/// on success and a typed error (with retryability) otherwise.
pub(crate) async fn check_response(
    resp: reqwest::Response,
    provider: &str,
) -> Result<Value> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<Value>().await?);
    }

    let retryable = status.as_u16() == 429 || status.is_server_error();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body);

    Err(ScintillaError::Provider {
        message: format!("{provider} API error ({status}): {message}"),
        retryable,
    }
    .into())
}
