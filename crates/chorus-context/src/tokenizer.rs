//! Heuristic token estimation used when no precise tokenizer is available.

use chorus_core::{TokenCount, Tokenizer};

/// Estimate tokens as `ceil(word_count / 0.75)`.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * 4).div_ceil(3)
}

/// Tokenizer that falls back to the word-count heuristic for every model.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountTokenizer;

impl Tokenizer for WordCountTokenizer {
    fn count_tokens(&self, text: &str, _model: &str) -> TokenCount {
        TokenCount {
            count: estimate_tokens(text),
            is_precise: false,
        }
    }
}
