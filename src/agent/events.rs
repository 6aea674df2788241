use serde::Serialize;
use serde_json::Value;

use crate::agent::citations::SourceRef;

/// Typed events streamed over the query endpoint. Exactly one terminal
/// event (`final_response` or `error`) closes every stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Thinking {
        content: String,
    },
    QueryPreprocessed {
        original: String,
        modified: String,
    },
    ToolCall {
        tool_name: String,
        arguments: Value,
        status: &'static str,
    },
    ToolResult {
        tool_name: String,
        result: String,
        status: &'static str,
    },
    FinalResponse {
        content: String,
        sources: Vec<SourceRef>,
        tool_calls: Vec<ToolCallSummary>,
        processing_stats: ProcessingStats,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl QueryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalResponse { .. } | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallSummary {
    pub tool: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    pub total_tools_called: usize,
    pub sources_found: usize,
    pub response_time_ms: u64,
    pub context_tokens_used: usize,
    pub context_optimized: bool,
}
