use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use blockrelay_core::chat::{Actor, ChatTurn, NewTurn, TurnMetadata, TurnPayload};
use blockrelay_core::errors::HistoryError;
use blockrelay_core::history::ChatHistoryStore;
use blockrelay_core::ids::{QueryId, SessionId, TurnId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "chat_turns";
const COLUMNS: &str = "id, session_id, query_id, actor, payload, metadata, created_at";

/// Conversation turns persisted in SQLite.
#[derive(Clone)]
pub struct TurnRepo {
    db: Database,
}

impl TurnRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, turn), fields(session_id = %turn.session_id, query_id = %turn.query_id, kind = turn.payload.kind().as_str()))]
    pub fn insert(&self, turn: NewTurn) -> Result<ChatTurn, StoreError> {
        let id = TurnId::new();
        let created_at = Utc::now();
        let payload = serde_json::to_string(&turn.payload)?;
        let metadata = serde_json::to_string(&turn.metadata)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_turns (id, session_id, query_id, actor, kind, payload, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    turn.session_id.as_str(),
                    turn.query_id.as_str(),
                    turn.actor.as_str(),
                    turn.payload.kind().as_str(),
                    payload,
                    metadata,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(ChatTurn::from_new(id, turn, created_at))
    }

    #[instrument(skip(self, payload), fields(turn_id = %turn_id))]
    pub fn update_payload(&self, turn_id: &TurnId, payload: &TurnPayload) -> Result<(), StoreError> {
        let raw = serde_json::to_string(payload)?;
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE chat_turns SET payload = ?1, kind = ?2 WHERE id = ?3",
                rusqlite::params![raw, payload.kind().as_str(), turn_id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("turn {turn_id}")));
        }
        Ok(())
    }

    pub fn get(&self, turn_id: &TurnId) -> Result<Option<ChatTurn>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM chat_turns WHERE id = ?1");
        let mut turns = self.query(&sql, &[turn_id.as_str()])?;
        Ok(turns.pop())
    }

    pub fn list_for_query(&self, session_id: &SessionId, query_id: &QueryId) -> Result<Vec<ChatTurn>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM chat_turns WHERE session_id = ?1 AND query_id = ?2 ORDER BY rowid");
        self.query(&sql, &[session_id.as_str(), query_id.as_str()])
    }

    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<ChatTurn>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM chat_turns WHERE session_id = ?1 ORDER BY rowid");
        self.query(&sql, &[session_id.as_str()])
    }

    fn query(&self, sql: &str, params: &[&str]) -> Result<Vec<ChatTurn>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }
            Ok(turns)
        })
    }
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<ChatTurn, StoreError> {
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let session_id: String = row_helpers::get(row, 1, TABLE, "session_id")?;
    let query_id: String = row_helpers::get(row, 2, TABLE, "query_id")?;
    let actor_raw: String = row_helpers::get(row, 3, TABLE, "actor")?;
    let payload_raw: String = row_helpers::get(row, 4, TABLE, "payload")?;
    let metadata_raw: Option<String> = row_helpers::get_opt(row, 5, TABLE, "metadata")?;
    let created_raw: String = row_helpers::get(row, 6, TABLE, "created_at")?;

    let actor = Actor::parse(&actor_raw).ok_or_else(|| StoreError::CorruptRow {
        table: TABLE,
        column: "actor",
        detail: format!("unknown variant: {actor_raw}"),
    })?;
    let payload: TurnPayload = row_helpers::parse_json(&payload_raw, TABLE, "payload")?;
    let metadata: TurnMetadata = match metadata_raw {
        Some(raw) => row_helpers::parse_json(&raw, TABLE, "metadata")?,
        None => TurnMetadata::default(),
    };

    Ok(ChatTurn {
        id: TurnId::from_raw(id),
        session_id: SessionId::from_raw(session_id),
        query_id: QueryId::from_raw(query_id),
        actor,
        payload,
        metadata,
        created_at: row_helpers::parse_timestamp(&created_raw, TABLE, "created_at")?,
    })
}

#[async_trait]
impl ChatHistoryStore for TurnRepo {
    async fn create_turn(&self, turn: NewTurn) -> Result<TurnId, HistoryError> {
        Ok(self.insert(turn)?.id)
    }

    async fn update_turn(&self, turn_id: &TurnId, payload: TurnPayload) -> Result<(), HistoryError> {
        Ok(self.update_payload(turn_id, &payload)?)
    }

    async fn list_turns(&self, session_id: &SessionId, query_id: &QueryId) -> Result<Vec<ChatTurn>, HistoryError> {
        Ok(self.list_for_query(session_id, query_id)?)
    }

    async fn session_turns(&self, session_id: &SessionId) -> Result<Vec<ChatTurn>, HistoryError> {
        Ok(self.list_for_session(session_id)?)
    }
}
