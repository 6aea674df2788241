use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::binding::{self, BoundTool};
use crate::agent::citations::{
    CollectedToolResult, build_citation_entries, build_sources, render_citation_guide,
    strip_sources_block,
};
use crate::agent::context::ContextManager;
use crate::agent::events::{ProcessingStats, QueryEvent, ToolCallSummary};
use crate::agent::prompts;
use crate::agent::result_processor::process_tool_result;
use crate::catalog::ToolCatalog;
use crate::db::{bots, conversations};
use crate::executor::{ToolCallOutcome, ToolExecutor};
use crate::providers::base::{ChatRequest, LLMProvider, Message, ToolDefinition};

/// Upper bound on LLM tool-calling turns per query. Reaching it is not an
/// error; synthesis still runs with a leading note.
const MAX_ITERATIONS: usize = 10;
/// Characters of a tool result shown in streamed `tool_result` events.
const TOOL_PREVIEW_LENGTH: usize = 500;
const DEFAULT_TEMPERATURE: f32 = 0.1;
const MAX_RESPONSE_TOKENS: u32 = 8192;

/// One streaming query against the broker.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub message: String,
    pub user_id: Uuid,
    pub model: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub selected_sources: Vec<Uuid>,
    pub selected_bots: Vec<Uuid>,
}

/// The LLM tool-calling loop with the citation pipeline. Emits typed
/// events on the supplied channel and never panics a request: any failure
/// becomes a terminal `error` event.
pub struct AgentLoop {
    pool: SqlitePool,
    catalog: Arc<ToolCatalog>,
    executor: Arc<ToolExecutor>,
}

impl AgentLoop {
    pub fn new(pool: SqlitePool, catalog: Arc<ToolCatalog>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            pool,
            catalog,
            executor,
        }
    }

    pub async fn run(
        &self,
        provider: Arc<dyn LLMProvider>,
        request: QueryRequest,
        events: mpsc::Sender<QueryEvent>,
    ) {
        if let Err(e) = self.run_inner(provider, request, &events).await {
            warn!("query failed: {e:#}");
            let _ = events
                .send(QueryEvent::Error {
                    error: format!("Query failed: {e}"),
                    details: Some(format!("{e:#}")),
                })
                .await;
        }
    }

    async fn run_inner(
        &self,
        provider: Arc<dyn LLMProvider>,
        request: QueryRequest,
        events: &mpsc::Sender<QueryEvent>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        let context = ContextManager::new(&model);

        if let Some(conversation_id) = request.conversation_id {
            conversations::ensure_conversation(&self.pool, conversation_id, request.user_id).await?;
            conversations::append_message(&self.pool, conversation_id, "user", &request.message)
                .await?;
        }

        // Effective source set: explicit selection plus bot bundles. With
        // nothing selected there is no tool loop at all.
        let sources = if request.selected_sources.is_empty() && request.selected_bots.is_empty() {
            Vec::new()
        } else {
            self.catalog
                .resolve_sources(
                    request.user_id,
                    &request.selected_sources,
                    &request.selected_bots,
                )
                .await?
        };

        if sources.is_empty() {
            let content = prompts::no_tools_answer();
            self.finish_without_tools(&request, &content, started, events)
                .await?;
            return Ok(());
        }

        let source_ids: Vec<Uuid> = sources.iter().map(|s| s.source_id).collect();
        let cached = self.catalog.load_tools(&source_ids).await?;
        let bound = binding::bind_tools(&sources, &cached);
        if bound.is_empty() {
            let content = prompts::no_tools_answer();
            self.finish_without_tools(&request, &content, started, events)
                .await?;
            return Ok(());
        }

        let search_tools = binding::filter_search_tools(&bound);
        anyhow::ensure!(!search_tools.is_empty(), "No search tools available");

        let source_names: Vec<String> = sources.iter().map(|s| s.name.clone()).collect();
        let instructions =
            bots::source_instructions(&self.pool, &sources, &request.selected_bots).await?;

        // Query preprocessing: silently fold mandatory project/space filters
        // into the query via a lightweight model.
        let mut message = request.message.clone();
        if let Some(prompt) = prompts::preprocess_prompt(&message, &instructions) {
            match provider
                .chat(
                    ChatRequest::new(vec![Message::user(prompt)])
                        .with_model(provider.fast_model()),
                )
                .await
            {
                Ok(response) => {
                    let rewritten = response.content.unwrap_or_default();
                    if prompts::accept_rewrite(&message, &rewritten) {
                        info!("query preprocessed: '{}' -> '{}'", message, rewritten.trim());
                        let modified = rewritten.trim().to_string();
                        if !emit(
                            events,
                            QueryEvent::QueryPreprocessed {
                                original: message.clone(),
                                modified: modified.clone(),
                            },
                        )
                        .await
                        {
                            return Ok(());
                        }
                        message = modified;
                    }
                }
                Err(e) => warn!("query preprocessing failed, using original: {e}"),
            }
        }

        let system = prompts::system_prompt(&search_tools, &source_names, &instructions);
        let definitions: Vec<ToolDefinition> =
            search_tools.iter().map(|t| t.definition.clone()).collect();

        if !emit(
            events,
            QueryEvent::Thinking {
                content: format!(
                    "Searching {} tools from {} sources...",
                    search_tools.len(),
                    source_names.len()
                ),
            },
        )
        .await
        {
            return Ok(());
        }

        let mut history = self.load_history(request.conversation_id).await?;
        let mut tool_results: Vec<String> = Vec::new();
        let mut buffer: Vec<CollectedToolResult> = Vec::new();
        let mut summaries: Vec<ToolCallSummary> = Vec::new();
        let mut optimized_any = false;
        let mut estimated_tokens = 0;
        let mut hit_limit = true;

        for iteration in 1..=MAX_ITERATIONS {
            let (opt_history, opt_results, optimized) =
                context.optimize(&system, history, &message, tool_results, "");
            history = opt_history;
            tool_results = opt_results;
            optimized_any |= optimized;

            estimated_tokens =
                context.estimate_context(&system, &history, &message, &tool_results, "");
            debug!("context usage: ~{estimated_tokens} tokens (iteration {iteration})");

            let mut messages = vec![Message::system(&system)];
            messages.extend(history.iter().filter(|m| m.role != "system").cloned());
            messages.push(Message::user(&message));

            let response = provider
                .chat_with_retry(
                    ChatRequest {
                        messages,
                        tools: Some(definitions.clone()),
                        model: Some(&model),
                        max_tokens: MAX_RESPONSE_TOKENS,
                        temperature: DEFAULT_TEMPERATURE,
                    },
                )
                .await?;

            if !response.has_tool_calls() {
                hit_limit = false;
                break;
            }

            for call in &response.tool_calls {
                if !emit(
                    events,
                    QueryEvent::ToolCall {
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        status: "running",
                    },
                )
                .await
                {
                    return Ok(());
                }
            }

            history.push(Message::assistant(
                response.content.clone().unwrap_or_default(),
                Some(response.tool_calls.clone()),
            ));

            // Tool calls run strictly in the order the LLM emitted them, and
            // each result lands in history before the next call goes out, so
            // tool-use / tool-result ids stay paired on replay.
            for call in response.tool_calls {
                let outcome = self.dispatch(&bound, &call.name, call.arguments.clone()).await;
                let raw_text = outcome.text();
                let truncated = context.truncate_tool_result(&raw_text);

                let original_name = binding::resolve(&bound, &call.name)
                    .map(|t| t.original_name.clone())
                    .unwrap_or_else(|| call.name.clone());
                buffer.push(CollectedToolResult {
                    tool_name: original_name.clone(),
                    arguments: call.arguments.clone(),
                    metadata: process_tool_result(&original_name, &raw_text, Some(&call.arguments)),
                    raw_result: raw_text.clone(),
                });

                summaries.push(ToolCallSummary {
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: outcome.result.clone(),
                    error: outcome.error.clone(),
                });

                if !emit(
                    events,
                    QueryEvent::ToolResult {
                        tool_name: call.name.clone(),
                        result: preview(&raw_text),
                        status: if outcome.success { "completed" } else { "error" },
                    },
                )
                .await
                {
                    return Ok(());
                }

                tool_results.push(truncated.clone());
                history.push(Message::tool_result(call.id, truncated, !outcome.success));
            }
        }

        // Final synthesis with the citation guide built from the buffer.
        let entries = build_citation_entries(&buffer);
        let guide = render_citation_guide(&entries);

        let (history, _, optimized) =
            context.optimize(&system, history, &message, tool_results, &guide);
        optimized_any |= optimized;

        let mut final_messages = vec![Message::system(&system)];
        final_messages.extend(history.iter().filter(|m| m.role != "system").cloned());
        final_messages.push(Message::user(&message));
        if !guide.is_empty() {
            final_messages.push(Message::user(prompts::citation_prompt(&guide)));
        }

        let final_response = provider
            .chat_with_retry(ChatRequest {
                messages: final_messages,
                tools: None,
                model: Some(&model),
                max_tokens: MAX_RESPONSE_TOKENS,
                temperature: DEFAULT_TEMPERATURE,
            })
            .await?;

        let mut content = final_response.content.unwrap_or_default();
        if hit_limit {
            content = format!(
                "I've reached the maximum number of tool iterations. Here's what I found:\n\n{content}"
            );
        }
        content = strip_sources_block(&content);

        if !guide.is_empty() {
            content = self
                .validate_response(provider.as_ref(), &model, content, &guide)
                .await;
        }

        let sources = build_sources(&entries, &content);

        if let Some(conversation_id) = request.conversation_id {
            conversations::append_message(&self.pool, conversation_id, "assistant", &content)
                .await?;
        }

        let stats = ProcessingStats {
            total_tools_called: summaries.len(),
            sources_found: sources.len(),
            response_time_ms: started.elapsed().as_millis() as u64,
            context_tokens_used: estimated_tokens,
            context_optimized: optimized_any,
        };
        let _ = events
            .send(QueryEvent::FinalResponse {
                content,
                sources,
                tool_calls: summaries,
                processing_stats: stats,
            })
            .await;

        Ok(())
    }

    async fn dispatch(
        &self,
        bound: &[BoundTool],
        namespaced_name: &str,
        arguments: Value,
    ) -> ToolCallOutcome {
        match binding::resolve(bound, namespaced_name) {
            Some(tool) => {
                self.executor
                    .call_tool(
                        &tool.server_url,
                        &tool.auth_headers,
                        &tool.original_name,
                        arguments,
                    )
                    .await
            }
            None => ToolCallOutcome::failed(
                namespaced_name,
                arguments,
                format!("Tool '{namespaced_name}' not found"),
            ),
        }
    }

    /// Optional validation pass: ask the model to fix broken URLs and
    /// citation numbering, but silently keep the original whenever the
    /// rewrite's length falls outside [0.5x, 2x].
    async fn validate_response(
        &self,
        provider: &dyn LLMProvider,
        model: &str,
        content: String,
        guide: &str,
    ) -> String {
        let prompt = prompts::validation_prompt(&content, guide);
        match provider
            .chat(
                ChatRequest::new(vec![Message::user(prompt)]).with_model(model),
            )
            .await
        {
            Ok(response) => {
                let validated = response.content.unwrap_or_default();
                if prompts::accept_validation(&content, &validated) {
                    validated.trim().to_string()
                } else {
                    debug!("validation rewrite rejected by length ratio, keeping original");
                    content
                }
            }
            Err(e) => {
                warn!("validation pass failed, keeping original: {e}");
                content
            }
        }
    }

    async fn load_history(&self, conversation_id: Option<Uuid>) -> anyhow::Result<Vec<Message>> {
        let Some(conversation_id) = conversation_id else {
            return Ok(Vec::new());
        };
        let stored = conversations::history(&self.pool, conversation_id).await?;
        Ok(stored
            .into_iter()
            .filter_map(|m| match m.role.as_str() {
                "user" => Some(Message::user(m.content)),
                "assistant" => Some(Message::assistant(m.content, None)),
                _ => None,
            })
            .collect())
    }

    async fn finish_without_tools(
        &self,
        request: &QueryRequest,
        content: &str,
        started: Instant,
        events: &mpsc::Sender<QueryEvent>,
    ) -> anyhow::Result<()> {
        if let Some(conversation_id) = request.conversation_id {
            conversations::append_message(&self.pool, conversation_id, "assistant", content)
                .await?;
        }
        let _ = events
            .send(QueryEvent::FinalResponse {
                content: content.to_string(),
                sources: Vec::new(),
                tool_calls: Vec::new(),
                processing_stats: ProcessingStats {
                    total_tools_called: 0,
                    sources_found: 0,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    context_tokens_used: 0,
                    context_optimized: false,
                },
            })
            .await;
        Ok(())
    }
}

fn preview(text: &str) -> String {
    if text.len() <= TOOL_PREVIEW_LENGTH {
        return text.to_string();
    }
    let mut end = TOOL_PREVIEW_LENGTH;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

async fn emit(events: &mpsc::Sender<QueryEvent>, event: QueryEvent) -> bool {
    events.send(event).await.is_ok()
}
