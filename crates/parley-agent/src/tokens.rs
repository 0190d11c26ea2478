//! Local token estimation.
//!
//! Only used to keep prompts inside the context window before a request is
//! sent. Usage numbers shown to users always come from the API itself.

use crate::provider::Message;

/// Every message is framed as `<|start|>{role}\n{content}<|end|>\n`.
const TOKENS_PER_MESSAGE: u32 = 4;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMER: u32 = 3;
/// Rough average for English text with BPE tokenizers.
const CHARS_PER_TOKEN: u32 = 4;

/// Used for models missing from the table below.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;

/// Context window of a known model, matched by longest prefix.
pub fn context_window(model: &str) -> u32 {
    const TABLE: &[(&str, u32)] = &[
        ("gpt-3.5-turbo-16k", 16_385),
        ("gpt-3.5-turbo", 16_385),
        ("gpt-4-32k", 32_768),
        ("gpt-4-turbo", 128_000),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 1_047_576),
        ("gpt-4", 8_192),
        ("o1", 200_000),
        ("o3", 200_000),
        ("o4-mini", 200_000),
    ];
    TABLE
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Estimated tokens for a piece of text.
pub fn estimate_text(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Estimated tokens for a single message, including framing.
pub fn estimate_message(message: &Message) -> u32 {
    TOKENS_PER_MESSAGE + estimate_text(message.role.as_str()) + estimate_text(&message.content)
}

/// Estimated prompt tokens for a list of messages.
pub fn estimate_messages(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message).sum::<u32>() + REPLY_PRIMER
}
