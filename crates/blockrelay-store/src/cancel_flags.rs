use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use blockrelay_core::cancel::{CancelFlag, CancellationFlags};
use blockrelay_core::errors::FlagError;
use blockrelay_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Cancellation flags in a database file shared by every process serving
/// the same sessions.
#[derive(Clone)]
pub struct SqliteCancellationFlags {
    db: Database,
}

impl SqliteCancellationFlags {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, session_id: &SessionId) -> Result<Option<CancelFlag>, StoreError> {
        let row: Option<(Option<String>, String)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT cause, set_at FROM cancel_flags WHERE session_id = ?1",
                    [session_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        row.map(|(cause, set_at)| {
            Ok(CancelFlag {
                cause,
                set_at: row_helpers::parse_timestamp(&set_at, "cancel_flags", "set_at")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn raise(&self, session_id: &SessionId, cause: Option<&str>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cancel_flags (session_id, cause, set_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET cause = excluded.cause, set_at = excluded.set_at",
                rusqlite::params![session_id.as_str(), cause, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM cancel_flags WHERE session_id = ?1", [session_id.as_str()])?)
        })?;
        if removed > 0 {
            debug!(session_id = %session_id, "cancellation flag cleared");
        }
        Ok(removed > 0)
    }
}

#[async_trait]
impl CancellationFlags for SqliteCancellationFlags {
    async fn check(&self, session_id: &SessionId) -> Result<Option<CancelFlag>, FlagError> {
        Ok(self.get(session_id)?)
    }

    async fn set(&self, session_id: &SessionId, cause: Option<String>) -> Result<(), FlagError> {
        Ok(self.raise(session_id, cause.as_deref())?)
    }

    async fn clear(&self, session_id: &SessionId) -> Result<(), FlagError> {
        self.remove(session_id)?;
        Ok(())
    }
}
