//! Per-invocation token accounting, accumulated across every model
//! response in an agent session.

use serde::{Deserialize, Serialize};

/// Cumulative token counters for one agent invocation.
///
/// The reasoning/text output split is optional: some providers report it
/// (Gemini), some only report a combined output count (Anthropic). A `None`
/// stays `None` until a provider supplies a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens_cache_read: u64,
    pub input_tokens_cache_write: u64,
    pub input_tokens_regular: u64,
    pub input_tokens_total: u64,
    pub output_tokens_reasoning: Option<u64>,
    pub output_tokens_text: Option<u64>,
    pub output_tokens_total: u64,
}

impl TokenUsage {
    /// Fold another response's usage into this accumulator.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens_cache_read += other.input_tokens_cache_read;
        self.input_tokens_cache_write += other.input_tokens_cache_write;
        self.input_tokens_regular += other.input_tokens_regular;
        self.input_tokens_total += other.input_tokens_total;
        self.output_tokens_reasoning =
            merge_opt(self.output_tokens_reasoning, other.output_tokens_reasoning);
        self.output_tokens_text = merge_opt(self.output_tokens_text, other.output_tokens_text);
        self.output_tokens_total += other.output_tokens_total;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens_total + self.output_tokens_total
    }
}

fn merge_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}
