use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;

use blockrelay_core::errors::HistoryError;
use blockrelay_core::ids::SessionId;
use blockrelay_core::session::SessionModels;

use crate::database::Database;
use crate::error::StoreError;

/// Per-session pinned model.
#[derive(Clone)]
pub struct SessionModelRepo {
    db: Database,
}

impl SessionModelRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, session_id: &SessionId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT model FROM session_models WHERE session_id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set(&self, session_id: &SessionId, model: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_models (session_id, model, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET model = excluded.model, updated_at = excluded.updated_at",
                rusqlite::params![session_id.as_str(), model, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl SessionModels for SessionModelRepo {
    async fn current_model(&self, session_id: &SessionId) -> Result<Option<String>, HistoryError> {
        Ok(self.get(session_id)?)
    }

    async fn set_current_model(&self, session_id: &SessionId, model: &str) -> Result<(), HistoryError> {
        Ok(self.set(session_id, model)?)
    }
}
