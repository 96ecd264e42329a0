//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Close enough
//! for BPE tokenizers on English text, and deterministic for tests.

use tidewire_core::message::Message;
use tidewire_core::provider::ToolDefinition;

/// Per-message overhead for role name, delimiters and formatting markers.
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single message, including tool-call arguments.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|tc| estimate_tokens(&tc.function.name) + estimate_tokens(&tc.function.arguments))
        .sum();
    MESSAGE_OVERHEAD + estimate_tokens(&message.content) + calls
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
