//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Exactness is
//! not required, only determinism and monotonicity: extending a text never
//! lowers its estimate.

use crate::message::ChatMessage;

/// Per-message framing cost (role name, delimiters) in the chat wire format.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

/// Estimate tokens for a single message body including per-message overhead.
pub fn estimate_message_tokens(content: &str) -> usize {
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(content)
}

/// Estimate tokens for a slice of prompt messages.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(ChatMessage::estimated_tokens).sum()
}
