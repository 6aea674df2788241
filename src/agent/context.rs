use tracing::{info, warn};

use crate::providers::base::Message;

/// Per-message overhead covering role tags and formatting.
const MESSAGE_OVERHEAD_TOKENS: usize = 5;
/// Characters per token for the fast estimate.
const CHARS_PER_TOKEN: f64 = 3.5;
/// Default cap for a single tool result, scaled down for small models.
const TOOL_RESULT_TOKENS: usize = 8000;
/// Tokens reserved for the model's own response, scaled down for small models.
const RESPONSE_RESERVE_TOKENS: usize = 5000;

/// Token limits for a model: full context window and the safe prompt limit
/// that leaves room for the response.
#[derive(Debug, Clone, Copy)]
pub struct ModelLimits {
    pub context_window: usize,
    pub safe_limit: usize,
}

impl ModelLimits {
    /// Table-driven lookup by model-name substring; unknown models get a
    /// conservative default.
    pub fn for_model(model_name: &str) -> Self {
        let claude = ["claude-3-5-sonnet", "claude-sonnet-4", "claude-3-haiku",
            "claude-3-5-haiku", "claude-3-opus"];
        if claude.iter().any(|m| model_name.contains(m)) {
            return Self {
                context_window: 200_000,
                safe_limit: 180_000,
            };
        }
        if model_name.contains("gpt-4o") || model_name.contains("gpt-4-turbo") {
            return Self {
                context_window: 128_000,
                safe_limit: 120_000,
            };
        }
        if model_name.contains("gpt-3.5-turbo") {
            return Self {
                context_window: 16_385,
                safe_limit: 15_000,
            };
        }
        if model_name.contains("gpt-4") {
            return Self {
                context_window: 8_192,
                safe_limit: 7_000,
            };
        }
        warn!("unknown model '{}', using conservative limits", model_name);
        Self {
            context_window: 8_192,
            safe_limit: 7_000,
        }
    }
}

/// Fast token estimate: whitespace-collapsed character count divided by 3.5,
/// rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let mut chars = 0usize;
    let mut in_whitespace = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                chars += 1;
            }
            in_whitespace = true;
        } else {
            chars += 1;
            in_whitespace = false;
        }
    }
    ((chars as f64) / CHARS_PER_TOKEN).ceil() as usize
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Find the largest byte index <= `index` that is a valid char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Keeps the assembled prompt within the model's safe limit.
#[derive(Debug, Clone)]
pub struct ContextManager {
    limits: ModelLimits,
}

impl ContextManager {
    pub fn new(model_name: &str) -> Self {
        Self {
            limits: ModelLimits::for_model(model_name),
        }
    }

    pub fn limits(&self) -> ModelLimits {
        self.limits
    }

    fn tool_result_budget(&self) -> usize {
        TOOL_RESULT_TOKENS.min(self.limits.safe_limit / 4)
    }

    fn response_reserve(&self) -> usize {
        RESPONSE_RESERVE_TOKENS.min(self.limits.safe_limit / 5)
    }

    /// Estimate the full prompt size.
    pub fn estimate_context(
        &self,
        system_prompt: &str,
        history: &[Message],
        current_message: &str,
        tool_results: &[String],
        citation_context: &str,
    ) -> usize {
        estimate_tokens(system_prompt)
            + history.iter().map(estimate_message_tokens).sum::<usize>()
            + estimate_tokens(current_message)
            + MESSAGE_OVERHEAD_TOKENS
            + tool_results.iter().map(|r| estimate_tokens(r)).sum::<usize>()
            + estimate_tokens(citation_context)
    }

    pub fn is_safe(
        &self,
        system_prompt: &str,
        history: &[Message],
        current_message: &str,
        tool_results: &[String],
        citation_context: &str,
    ) -> bool {
        self.estimate_context(system_prompt, history, current_message, tool_results, citation_context)
            <= self.limits.safe_limit
    }

    /// Keep the newest history messages that fit the remaining budget,
    /// preserving their original order in the returned transcript.
    pub fn truncate_history(&self, history: Vec<Message>, reserved_tokens: usize) -> Vec<Message> {
        if history.is_empty() {
            return history;
        }
        let available = self.limits.safe_limit.saturating_sub(reserved_tokens);

        let mut kept = std::collections::VecDeque::new();
        let mut used = 0usize;
        for msg in history.into_iter().rev() {
            let tokens = estimate_message_tokens(&msg);
            if used + tokens > available {
                break;
            }
            used += tokens;
            kept.push_front(msg);
        }
        kept.into()
    }

    /// Truncate an oversized tool result, keeping the first 70% and last 30%
    /// of the character budget around a marker stating what was removed.
    pub fn truncate_tool_result(&self, result: &str) -> String {
        self.truncate_tool_result_to(result, self.tool_result_budget())
    }

    pub fn truncate_tool_result_to(&self, result: &str, max_tokens: usize) -> String {
        if estimate_tokens(result) <= max_tokens {
            return result.to_string();
        }

        let max_chars = ((max_tokens as f64) * CHARS_PER_TOKEN) as usize;
        if result.len() <= max_chars {
            return result.to_string();
        }

        let head_len = (max_chars * 7) / 10;
        let tail_len = max_chars - head_len;
        if result.len() <= head_len + tail_len + 200 {
            return result.to_string();
        }

        let head_end = floor_char_boundary(result, head_len);
        let tail_start = floor_char_boundary(result, result.len() - tail_len);
        let removed = tail_start - head_end;

        format!(
            "{}\n\n[... TRUNCATED: {} characters removed for context size management ...]\n\n{}",
            &result[..head_end],
            removed,
            &result[tail_start..]
        )
    }

    /// Fit history and tool results into the safe limit. Inputs that are
    /// already safe are returned unchanged, so the operation is idempotent.
    /// Returns `(history, tool_results, optimized)`.
    pub fn optimize(
        &self,
        system_prompt: &str,
        history: Vec<Message>,
        current_message: &str,
        tool_results: Vec<String>,
        citation_context: &str,
    ) -> (Vec<Message>, Vec<String>, bool) {
        if self.is_safe(system_prompt, &history, current_message, &tool_results, citation_context) {
            return (history, tool_results, false);
        }

        let before = self.estimate_context(
            system_prompt,
            &history,
            current_message,
            &tool_results,
            citation_context,
        );

        let tool_results: Vec<String> = tool_results
            .iter()
            .map(|r| self.truncate_tool_result(r))
            .collect();

        let non_history = estimate_tokens(system_prompt)
            + estimate_tokens(current_message)
            + MESSAGE_OVERHEAD_TOKENS
            + tool_results.iter().map(|r| estimate_tokens(r)).sum::<usize>()
            + estimate_tokens(citation_context);
        let reserved = non_history + self.response_reserve();

        let history_len = history.len();
        let history = self.truncate_history(history, reserved);

        let after = self.estimate_context(
            system_prompt,
            &history,
            current_message,
            &tool_results,
            citation_context,
        );
        info!(
            "context optimized: {} -> {} tokens ({} -> {} history messages)",
            before,
            after,
            history_len,
            history.len()
        );
        if after > self.limits.safe_limit {
            warn!(
                "context still above safe limit after optimization: {}/{}",
                after, self.limits.safe_limit
            );
        }

        (history, tool_results, true)
    }
}
