use serde::{Deserialize, Serialize};

/// Token counters reported out of band by a provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Fold in a later report of the same response. Providers send running
    /// totals, so each counter keeps its highest value; a counter absent from
    /// a report arrives as zero and leaves the earlier value alone.
    pub fn merge_cumulative(&mut self, later: TokenUsage) {
        self.input_tokens = self.input_tokens.max(later.input_tokens);
        self.output_tokens = self.output_tokens.max(later.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(later.cache_read_tokens);
        self.cache_creation_tokens = self.cache_creation_tokens.max(later.cache_creation_tokens);
    }
}
