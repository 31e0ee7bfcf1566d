use crate::chat::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    pub tokens: TokenUsage,
    pub estimated: bool,
}

impl UsageStats {
    pub fn estimated(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            tokens: TokenUsage::new(prompt_tokens, completion_tokens),
            estimated: true,
        }
    }
}

/// Roughly four characters per token. Zero only for empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    tokens_for_chars(text.chars().count() as u64)
}

fn tokens_for_chars(chars: u64) -> u64 {
    if chars == 0 {
        return 0;
    }
    chars.div_ceil(4).max(1)
}

pub fn estimate_prompt_tokens(messages: &[Message]) -> u64 {
    let text = serde_json::to_string(messages).unwrap_or_default();
    estimate_tokens(&text)
}

/// Estimates the concatenation of reasoning and content.
pub fn estimate_completion_tokens(reasoning: &str, content: &str) -> u64 {
    tokens_for_chars(reasoning.chars().count() as u64 + content.chars().count() as u64)
}

/// Reads an OpenAI-style `usage` object from a chunk. Missing counters
/// default to zero; a non-object `usage` is ignored.
pub fn parse_usage_from_chat_object(obj: &Value) -> Option<UsageStats> {
    let usage = obj.get("usage")?.as_object()?;
    let counter = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    Some(UsageStats {
        tokens: TokenUsage {
            prompt_tokens: counter("prompt_tokens"),
            completion_tokens: counter("completion_tokens"),
            total_tokens: counter("total_tokens"),
        },
        estimated: false,
    })
}
