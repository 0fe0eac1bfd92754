use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument};

use blockrelay_core::broadcast::{BroadcastEntry, BroadcastLog, LogConfig, Offset, StreamInfo};
use blockrelay_core::errors::LogError;
use blockrelay_core::ids::QueryId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Broadcast log persisted in SQLite.
///
/// Several processes may share the database file: appends made here wake
/// local readers immediately, appends made elsewhere are picked up at the
/// next poll.
#[derive(Clone)]
pub struct SqliteBroadcastLog {
    db: Database,
    config: LogConfig,
    appended: Arc<Notify>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Row of `streams`. Expired rows stay behind as offset marks until
/// `purge_expired` forgets them.
struct StreamRow {
    first_offset: u64,
    last_offset: u64,
    expires_at_ms: i64,
}

impl StreamRow {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms > now
    }
}

fn stream_row(conn: &Connection, stream_id: &str) -> Result<Option<StreamRow>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT first_offset, last_offset, expires_at_ms FROM streams WHERE stream_id = ?1",
            [stream_id],
            |row| {
                Ok(StreamRow {
                    first_offset: row.get::<_, i64>(0)?.max(0) as u64,
                    last_offset: row.get::<_, i64>(1)?.max(0) as u64,
                    expires_at_ms: row.get(2)?,
                })
            },
        )
        .optional()?)
}

fn live_stream(conn: &Connection, stream_id: &str, now: i64) -> Result<Option<StreamRow>, StoreError> {
    Ok(stream_row(conn, stream_id)?.filter(|row| row.is_live(now)))
}

fn drop_stream(conn: &Connection, stream_id: &str) -> Result<bool, StoreError> {
    conn.execute("DELETE FROM stream_entries WHERE stream_id = ?1", [stream_id])?;
    let removed = conn.execute("DELETE FROM streams WHERE stream_id = ?1", [stream_id])?;
    Ok(removed > 0)
}

impl SqliteBroadcastLog {
    pub fn new(db: Database, config: LogConfig) -> Self {
        Self {
            db,
            config,
            appended: Arc::new(Notify::new()),
        }
    }

    #[instrument(skip(self, payload), fields(stream_id = %stream_id))]
    pub fn append_now(&self, stream_id: &QueryId, payload: &str) -> Result<Offset, StoreError> {
        let ttl = ttl_ms(self.config.ttl);
        let offset = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = now_ms();
            let (first, last) = match stream_row(&tx, stream_id.as_str())? {
                Some(row) if row.is_live(now) => (row.first_offset, row.last_offset),
                Some(row) => {
                    // Revived after expiry: old entries go, numbering continues.
                    tx.execute("DELETE FROM stream_entries WHERE stream_id = ?1", [stream_id.as_str()])?;
                    (row.last_offset + 1, row.last_offset)
                }
                None => (1, 0),
            };
            let next = last + 1;
            tx.execute(
                "INSERT INTO streams (stream_id, first_offset, last_offset, expires_at_ms) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream_id) DO UPDATE SET first_offset = excluded.first_offset,
                     last_offset = excluded.last_offset, expires_at_ms = excluded.expires_at_ms",
                rusqlite::params![stream_id.as_str(), first as i64, next as i64, now.saturating_add(ttl)],
            )?;
            tx.execute(
                "INSERT INTO stream_entries (stream_id, seq, payload, arrived_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![stream_id.as_str(), next as i64, payload, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(Offset(next))
        })?;
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Entries after `after` without waiting. Missing or expired streams
    /// are `NotFound`, and so is a cursor into entries dropped at expiry.
    pub fn read_now(&self, stream_id: &QueryId, after: Offset) -> Result<Vec<BroadcastEntry>, StoreError> {
        let limit = self.config.batch_limit as i64;
        self.db.with_conn(|conn| {
            let Some(row) = live_stream(conn, stream_id.as_str(), now_ms())? else {
                return Err(StoreError::NotFound(format!("stream {stream_id}")));
            };
            if after != Offset::START && after.0 + 1 < row.first_offset {
                return Err(StoreError::NotFound(format!("stream {stream_id} before offset {}", row.first_offset)));
            }
            let mut stmt = conn.prepare(
                "SELECT seq, payload, arrived_at FROM stream_entries
                 WHERE stream_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![stream_id.as_str(), after.0 as i64, limit])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let seq: i64 = row_helpers::get(row, 0, "stream_entries", "seq")?;
                let arrived: String = row_helpers::get(row, 2, "stream_entries", "arrived_at")?;
                entries.push(BroadcastEntry {
                    offset: Offset(seq.max(0) as u64),
                    payload: row_helpers::get(row, 1, "stream_entries", "payload")?,
                    arrived_at: row_helpers::parse_timestamp(&arrived, "stream_entries", "arrived_at")?,
                });
            }
            Ok(entries)
        })
    }

    pub fn stream_info(&self, stream_id: &QueryId) -> Result<Option<StreamInfo>, StoreError> {
        self.db.with_conn(|conn| {
            let now = now_ms();
            let Some(row) = live_stream(conn, stream_id.as_str(), now)? else {
                return Ok(None);
            };
            let length: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stream_entries WHERE stream_id = ?1",
                [stream_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(Some(StreamInfo {
                length: length.max(0) as u64,
                last_offset: Offset(row.last_offset),
                expires_in: Duration::from_millis((row.expires_at_ms - now).max(0) as u64),
            }))
        })
    }

    pub fn remove(&self, stream_id: &QueryId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = drop_stream(&tx, stream_id.as_str())?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Drop the entries of every expired stream and forget offset marks
    /// older than the retention window. Returns how many streams were
    /// emptied.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let retention = ttl_ms(self.config.mark_retention);
        let purged = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = now_ms();
            tx.execute(
                "DELETE FROM stream_entries WHERE stream_id IN
                 (SELECT stream_id FROM streams WHERE expires_at_ms <= ?1)",
                [now],
            )?;
            let purged = tx.execute(
                "UPDATE streams SET first_offset = last_offset + 1
                 WHERE expires_at_ms <= ?1 AND first_offset <= last_offset",
                [now],
            )?;
            tx.execute(
                "DELETE FROM streams WHERE expires_at_ms <= ?1",
                [now.saturating_sub(retention)],
            )?;
            tx.commit()?;
            Ok(purged)
        })?;
        if purged > 0 {
            debug!(purged, "expired streams purged");
        }
        Ok(purged)
    }
}

#[async_trait]
impl BroadcastLog for SqliteBroadcastLog {
    async fn append(&self, stream_id: &QueryId, payload: &str) -> Result<Offset, LogError> {
        Ok(self.append_now(stream_id, payload)?)
    }

    async fn read(
        &self,
        stream_id: &QueryId,
        after: Offset,
        block: Option<Duration>,
    ) -> Result<Vec<BroadcastEntry>, LogError> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            // Register for wakeups before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.read_now(stream_id, after)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(entries);
            }
            let wait = (deadline - now).min(self.config.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn exists(&self, stream_id: &QueryId) -> Result<bool, LogError> {
        Ok(self.stream_info(stream_id)?.is_some())
    }

    async fn delete(&self, stream_id: &QueryId) -> Result<bool, LogError> {
        Ok(self.remove(stream_id)?)
    }

    async fn info(&self, stream_id: &QueryId) -> Result<Option<StreamInfo>, LogError> {
        Ok(self.stream_info(stream_id)?)
    }
}
