use async_trait::async_trait;

use crate::chat::ChatTurn;
use crate::errors::ProviderError;
use crate::ids::SessionId;

/// Produces a short summary of a finished query.
#[async_trait]
pub trait SessionSummarizer: Send + Sync {
    async fn summarize(&self, session_id: &SessionId, turns: &[ChatTurn]) -> Result<String, ProviderError>;
}
