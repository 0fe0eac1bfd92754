use serde::{Deserialize, Serialize};

/// A model that sessions may be pinned to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
    pub provider: String,
    pub input_token_limit: u64,
}

impl ModelInfo {
    fn new(name: &str, display_name: &str, provider: &str, input_token_limit: u64) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            provider: provider.to_string(),
            input_token_limit,
        }
    }
}

/// Known models, used to suggest alternatives when a prompt outgrows a
/// model's input window.
#[derive(Clone, Debug)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ModelInfo::new("claude-opus-4-6", "Claude Opus 4.6", "anthropic", 200_000),
            ModelInfo::new("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5", "anthropic", 200_000),
            ModelInfo::new("claude-sonnet-4-5-1m", "Claude Sonnet 4.5 (1M)", "anthropic", 1_000_000),
            ModelInfo::new("claude-haiku-4-5-20251001", "Claude Haiku 4.5", "anthropic", 200_000),
            ModelInfo::new("gpt-4.1", "GPT-4.1", "openai", 1_047_576),
            ModelInfo::new("gpt-4o", "GPT-4o", "openai", 128_000),
            ModelInfo::new("gemini-2.5-pro", "Gemini 2.5 Pro", "google", 1_048_576),
        ])
    }

    pub fn find(&self, name: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn all(&self) -> &[ModelInfo] {
        &self.models
    }

    /// Models other than `model` whose input window exceeds `max_tokens`,
    /// largest first. A zero `max_tokens` falls back to `model`'s own window.
    pub fn larger_than(&self, model: &str, max_tokens: u64) -> Vec<&ModelInfo> {
        let threshold = if max_tokens > 0 {
            max_tokens
        } else {
            self.find(model).map_or(0, |m| m.input_token_limit)
        };
        let mut better: Vec<&ModelInfo> = self
            .models
            .iter()
            .filter(|m| m.name != model && m.input_token_limit > threshold)
            .collect();
        better.sort_by(|a, b| b.input_token_limit.cmp(&a.input_token_limit));
        better
    }

    pub fn display_name<'a>(&'a self, model: &'a str) -> &'a str {
        self.find(model).map_or(model, |m| m.display_name.as_str())
    }
}
