//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Good enough
//! for compaction thresholds when the backend does not report usage.

use blade_core::compaction::TokenCounter;
use blade_core::message::Message;
use blade_core::provider::ToolDefinition;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Estimate tokens for a single message including per-message overhead.
///
/// Each message costs ~4 tokens of overhead for role name and delimiters.
/// Reasoning text and tool-call arguments count toward the total.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let overhead = 4;
    let reasoning = message
        .reasoning_content
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments))
        .sum();
    overhead + estimate_tokens(&message.content) + reasoning + calls
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for a tool definition (serialized as JSON).
pub fn estimate_tool_tokens(tool: &ToolDefinition) -> usize {
    let json = serde_json::to_string(tool).unwrap_or_default();
    estimate_tokens(&json)
}

/// Estimate tokens for a slice of tool definitions.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools.iter().map(estimate_tool_tokens).sum()
}

/// [`TokenCounter`] backed by the character heuristic. Model-agnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct EstimatingTokenCounter;

impl TokenCounter for EstimatingTokenCounter {
    fn count(&self, messages: &[Message], _model_id: &str) -> usize {
        estimate_messages_tokens(messages)
    }
}
