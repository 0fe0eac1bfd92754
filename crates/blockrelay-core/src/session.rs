use async_trait::async_trait;

use crate::errors::HistoryError;
use crate::ids::SessionId;

/// Which model a session is currently pinned to.
#[async_trait]
pub trait SessionModels: Send + Sync {
    async fn current_model(&self, session_id: &SessionId) -> Result<Option<String>, HistoryError>;
    async fn set_current_model(&self, session_id: &SessionId, model: &str) -> Result<(), HistoryError>;
}
