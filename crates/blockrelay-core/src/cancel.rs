use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FlagError;
use crate::ids::SessionId;

/// A raised cancellation request for one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelFlag {
    pub cause: Option<String>,
    pub set_at: DateTime<Utc>,
}

/// Session-scoped cancellation flags in storage shared across processes.
/// Set by an unrelated request path; only read and cleared by the engine.
#[async_trait]
pub trait CancellationFlags: Send + Sync {
    async fn check(&self, session_id: &SessionId) -> Result<Option<CancelFlag>, FlagError>;
    async fn set(&self, session_id: &SessionId, cause: Option<String>) -> Result<(), FlagError>;
    async fn clear(&self, session_id: &SessionId) -> Result<(), FlagError>;
}
