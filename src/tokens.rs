//! Token estimates for providers that stream without reporting usage.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

/// Per-message framing overhead in the chat format.
const TOKENS_PER_MESSAGE: usize = 4;

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("Could not load cl100k encoder, falling back to byte estimate: {:?}", e);
        None
    }
});

/// Count tokens for a piece of UTF-8 text.
pub fn count_tokens(text: &str) -> usize {
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Prompt size of a conversation given its message texts.
pub fn count_prompt_tokens<'a>(messages: impl IntoIterator<Item = &'a str>) -> usize {
    messages
        .into_iter()
        .map(|m| count_tokens(m) + TOKENS_PER_MESSAGE)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_basic() {
        assert_eq!(count_tokens("Hello, world!"), 4);
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("Hello"), 1);
    }

    #[test]
    fn test_prompt_tokens_include_framing() {
        let total = count_prompt_tokens(["Hello", "Hello, world!"]);
        assert_eq!(total, 1 + 4 + 4 + 4);
        assert_eq!(count_prompt_tokens(Vec::<&str>::new()), 0);
    }
}
