use std::time::Duration;

/// Typed failures surfaced by a model provider, either before streaming
/// starts or in-band as a stream item.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} throttled requests for {model}")]
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
        current_tokens: u64,
        max_tokens: u64,
        detail: String,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::Server { .. } | Self::Network(_) | Self::StreamInterrupted(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::TokenLimitExceeded { .. } => "token_limit_exceeded",
            Self::Auth(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Server { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
        }
    }

    /// Classify an HTTP failure from `provider` serving `model`.
    pub fn from_status(
        provider: &str,
        model: &str,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    ) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            429 => Self::Throttled {
                provider: provider.to_string(),
                model: model.to_string(),
                retry_after,
                detail: body,
                region: None,
            },
            400 | 413 if mentions_context_limit(&body) => {
                let (current_tokens, max_tokens) = token_counts(&body).unwrap_or((0, 0));
                Self::TokenLimitExceeded {
                    model: model.to_string(),
                    current_tokens,
                    max_tokens,
                    detail: body,
                }
            }
            400 | 404 | 413 | 422 => Self::InvalidRequest(body),
            500..=599 => Self::Server { status, message: body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

fn mentions_context_limit(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["prompt is too long", "context length", "context window", "too many tokens", "input is too long"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// First two integers in a message like "prompt is too long: 250123 tokens > 200000 maximum".
fn token_counts(body: &str) -> Option<(u64, u64)> {
    let mut numbers = body
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u64>().ok());
    let current = numbers.next()?;
    let max = numbers.next()?;
    Some((current, max))
}

/// Failures of the chat history collaborator.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum HistoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("history backend error: {0}")]
    Backend(String),
}

/// Failures of the broadcast log.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LogError {
    /// The stream never existed or its TTL elapsed.
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error("log backend error: {message}")]
    Backend { message: String, transient: bool },
}

impl LogError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }
}

/// Failures of the shared cancellation flag storage.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FlagError {
    #[error("cancellation flag backend error: {0}")]
    Backend(String),
}
