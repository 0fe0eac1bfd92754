use async_trait::async_trait;

use crate::chat::{ChatTurn, NewTurn, TurnPayload};
use crate::errors::HistoryError;
use crate::ids::{QueryId, SessionId, ToolUseId, TurnId};

/// Durable conversation history.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    async fn create_turn(&self, turn: NewTurn) -> Result<TurnId, HistoryError>;

    /// Replace a turn's payload. Used only to backfill tool responses.
    async fn update_turn(&self, turn_id: &TurnId, payload: TurnPayload) -> Result<(), HistoryError>;

    /// Turns of one query in creation order.
    async fn list_turns(
        &self,
        session_id: &SessionId,
        query_id: &QueryId,
    ) -> Result<Vec<ChatTurn>, HistoryError>;

    /// Every turn of a session in creation order.
    async fn session_turns(&self, session_id: &SessionId) -> Result<Vec<ChatTurn>, HistoryError>;

    async fn find_tool_use(
        &self,
        session_id: &SessionId,
        query_id: &QueryId,
        tool_use_id: &ToolUseId,
    ) -> Result<Option<ChatTurn>, HistoryError> {
        let turns = self.list_turns(session_id, query_id).await?;
        Ok(turns.into_iter().find(|t| {
            t.payload
                .as_tool_use()
                .is_some_and(|p| &p.tool_use_id == tool_use_id)
        }))
    }
}
