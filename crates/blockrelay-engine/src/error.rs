use std::time::Duration;

use blockrelay_core::errors::{FlagError, HistoryError, LogError, ProviderError};
use blockrelay_core::ids::{QueryId, ToolUseId};
use blockrelay_core::wire::{ErrorStatus, StreamErrorContent};
use blockrelay_llm::models::{ModelCatalog, ModelInfo};
use blockrelay_llm::NormalizeError;

const THROTTLED_MESSAGE: &str =
    "This chat is currently being throttled. You can wait, or switch to a different model.";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{provider} throttled {model}")]
    Throttled {
        provider: String,
        model: String,
        retry_after: Option<Duration>,
        detail: String,
        region: Option<String>,
    },

    #[error("input token limit exceeded for {model}: {current_tokens} > {max_tokens}")]
    TokenLimitExceeded {
        model: String,
        display_name: String,
        current_tokens: u64,
        max_tokens: u64,
        detail: String,
        alternatives: Vec<ModelInfo>,
    },

    #[error("generation cancelled")]
    Cancelled { cause: Option<String> },

    #[error("malformed arguments for tool {tool_name} ({tool_use_id}): {detail}")]
    MalformedToolArguments {
        tool_use_id: ToolUseId,
        tool_name: String,
        detail: String,
    },

    #[error("stream expired: {stream_id}")]
    StreamExpired { stream_id: QueryId },

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("cancellation flag error: {0}")]
    Flags(#[from] FlagError),

    #[error("unknown tool use: {0}")]
    UnknownToolUse(ToolUseId),

    #[error("tool use already resolved: {0}")]
    ToolAlreadyResolved(ToolUseId),

    #[error("query not found: {0}")]
    QueryNotFound(QueryId),

    #[error("max rounds exceeded: {0}")]
    MaxRoundsExceeded(u32),
}

impl EngineError {
    /// Lift a provider failure, attaching larger-window alternatives to
    /// token-limit errors.
    pub fn from_provider(err: ProviderError, catalog: &ModelCatalog) -> Self {
        match err {
            ProviderError::Throttled {
                provider,
                model,
                retry_after,
                detail,
                region,
            } => Self::Throttled {
                provider,
                model,
                retry_after,
                detail,
                region,
            },
            ProviderError::TokenLimitExceeded {
                model,
                current_tokens,
                max_tokens,
                detail,
            } => Self::TokenLimitExceeded {
                display_name: catalog.display_name(&model).to_string(),
                alternatives: catalog.larger_than(&model, max_tokens).into_iter().cloned().collect(),
                model,
                current_tokens,
                max_tokens,
                detail,
            },
            other => Self::Provider(other),
        }
    }

    pub fn from_normalize(err: NormalizeError, catalog: &ModelCatalog, cause: Option<String>) -> Self {
        match err {
            NormalizeError::Cancelled => Self::Cancelled { cause },
            NormalizeError::Provider(e) => Self::from_provider(e, catalog),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Structured `STREAM_ERROR` content for this failure. `query` is the
    /// user's text for the round, echoed back on token-limit errors.
    pub fn to_stream_error(&self, query: Option<&str>) -> StreamErrorContent {
        match self {
            Self::Throttled {
                provider,
                model,
                retry_after,
                detail,
                region,
            } => StreamErrorContent::new(ErrorStatus::LlmThrottled, THROTTLED_MESSAGE)
                .with("provider", provider)
                .with("model", model)
                .with("retry_after", retry_after.map(|d| d.as_secs()))
                .with("detail", detail)
                .with("region", region),
            Self::TokenLimitExceeded {
                model,
                display_name,
                current_tokens,
                max_tokens,
                detail,
                alternatives,
            } => StreamErrorContent::new(
                ErrorStatus::InputTokenLimitExceeded,
                format!(
                    "Your message exceeds the context window supported by {display_name}. \
                     Try switching to a model with a higher context window to proceed."
                ),
            )
            .with("model", model)
            .with("current_tokens", current_tokens)
            .with("max_tokens", max_tokens)
            .with("query", query)
            .with("detail", detail)
            .with("better_models", alternatives),
            Self::Cancelled { cause } => {
                StreamErrorContent::new(ErrorStatus::Cancelled, "LLM processing cancelled").with("cause", cause)
            }
            Self::MalformedToolArguments {
                tool_use_id,
                tool_name,
                detail,
            } => StreamErrorContent::new(
                ErrorStatus::MalformedToolArguments,
                format!("LLM processing error: malformed arguments for tool {tool_name}"),
            )
            .with("tool_use_id", tool_use_id)
            .with("tool_name", tool_name)
            .with("detail", detail),
            Self::StreamExpired { stream_id } => {
                StreamErrorContent::new(ErrorStatus::StreamExpired, format!("stream {stream_id} has expired"))
                    .with("stream_id", stream_id)
            }
            other => StreamErrorContent::new(ErrorStatus::LlmError, format!("LLM processing error: {other}")),
        }
    }
}
