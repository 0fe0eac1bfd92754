//! In-process collaborators for tests and single-node embedding.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use blockrelay_core::broadcast::{BroadcastEntry, BroadcastLog, LogConfig, Offset, StreamInfo};
use blockrelay_core::cancel::{CancelFlag, CancellationFlags};
use blockrelay_core::chat::{ChatTurn, NewTurn, TurnPayload};
use blockrelay_core::errors::{FlagError, HistoryError, LogError};
use blockrelay_core::history::ChatHistoryStore;
use blockrelay_core::ids::{QueryId, SessionId, TurnId};
use blockrelay_core::session::SessionModels;

struct MemoryStream {
    entries: Vec<BroadcastEntry>,
    /// Lowest offset still held; earlier ones were dropped at expiry.
    first_offset: Offset,
    last_offset: Offset,
    expires_at: Instant,
}

impl MemoryStream {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn expire(&mut self) {
        self.entries.clear();
        self.first_offset = self.last_offset.next();
    }
}

/// Broadcast log held in process memory. Same contract as the SQLite log:
/// every append refreshes the TTL, an expired stream reads as not found, and
/// offsets continue across expiry while the stream's mark is retained.
pub struct MemoryBroadcastLog {
    config: LogConfig,
    streams: DashMap<QueryId, MemoryStream>,
    appended: Notify,
    next_purge: Mutex<Instant>,
}

impl MemoryBroadcastLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            streams: DashMap::new(),
            appended: Notify::new(),
            next_purge: Mutex::new(Instant::now() + config.ttl),
            config,
        }
    }

    /// Drop the entries of every expired stream and forget marks older than
    /// the retention window. Returns how many streams were emptied.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for mut stream in self.streams.iter_mut() {
            if !stream.is_live(now) && stream.first_offset <= stream.last_offset {
                stream.expire();
                purged += 1;
            }
        }
        let retention = self.config.mark_retention;
        self.streams.retain(|_, s| s.expires_at + retention > now);
        purged
    }

    /// Purge at most once per TTL, piggybacked on appends.
    fn purge_if_due(&self, now: Instant) {
        {
            let mut next = self.next_purge.lock();
            if now < *next {
                return;
            }
            *next = now + self.config.ttl;
        }
        let purged = self.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "purged expired in-memory streams");
        }
    }

    /// Number of streams held, live or retained as offset marks.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn read_now(&self, stream_id: &QueryId, after: Offset) -> Result<Vec<BroadcastEntry>, LogError> {
        let stream = self
            .streams
            .get(stream_id)
            .filter(|s| s.is_live(Instant::now()))
            .ok_or_else(|| LogError::NotFound(stream_id.to_string()))?;
        if after != Offset::START && after.next() < stream.first_offset {
            return Err(LogError::NotFound(format!("{stream_id} before offset {}", stream.first_offset)));
        }
        Ok(stream
            .entries
            .iter()
            .filter(|e| e.offset > after)
            .take(self.config.batch_limit)
            .cloned()
            .collect())
    }
}

impl Default for MemoryBroadcastLog {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

#[async_trait]
impl BroadcastLog for MemoryBroadcastLog {
    async fn append(&self, stream_id: &QueryId, payload: &str) -> Result<Offset, LogError> {
        let now = Instant::now();
        let offset = {
            let mut stream = self.streams.entry(stream_id.clone()).or_insert_with(|| MemoryStream {
                entries: Vec::new(),
                first_offset: Offset(1),
                last_offset: Offset::START,
                expires_at: now,
            });
            if !stream.is_live(now) && !stream.entries.is_empty() {
                stream.expire();
            }
            let offset = stream.last_offset.next();
            stream.entries.push(BroadcastEntry {
                offset,
                payload: payload.to_string(),
                arrived_at: Utc::now(),
            });
            stream.last_offset = offset;
            stream.expires_at = now + self.config.ttl;
            offset
        };
        self.appended.notify_waiters();
        self.purge_if_due(now);
        Ok(offset)
    }

    async fn read(
        &self,
        stream_id: &QueryId,
        after: Offset,
        block: Option<Duration>,
    ) -> Result<Vec<BroadcastEntry>, LogError> {
        let Some(block) = block else {
            return self.read_now(stream_id, after);
        };
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_now(stream_id, after)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let wait = deadline.saturating_duration_since(Instant::now()).min(self.config.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn exists(&self, stream_id: &QueryId) -> Result<bool, LogError> {
        let now = Instant::now();
        Ok(self.streams.get(stream_id).is_some_and(|s| s.is_live(now)))
    }

    async fn delete(&self, stream_id: &QueryId) -> Result<bool, LogError> {
        let removed = self.streams.remove(stream_id).is_some();
        self.appended.notify_waiters();
        Ok(removed)
    }

    async fn info(&self, stream_id: &QueryId) -> Result<Option<StreamInfo>, LogError> {
        let now = Instant::now();
        Ok(self.streams.get(stream_id).filter(|s| s.is_live(now)).map(|s| StreamInfo {
            length: s.entries.len() as u64,
            last_offset: s.last_offset,
            expires_in: s.expires_at.saturating_duration_since(now),
        }))
    }
}

/// Chat history kept in insertion order.
#[derive(Default)]
pub struct MemoryHistory {
    turns: Mutex<Vec<ChatTurn>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.turns.lock().clone()
    }
}

#[async_trait]
impl ChatHistoryStore for MemoryHistory {
    async fn create_turn(&self, turn: NewTurn) -> Result<TurnId, HistoryError> {
        let id = TurnId::new();
        self.turns.lock().push(ChatTurn::from_new(id.clone(), turn, Utc::now()));
        Ok(id)
    }

    async fn update_turn(&self, turn_id: &TurnId, payload: TurnPayload) -> Result<(), HistoryError> {
        let mut turns = self.turns.lock();
        let turn = turns
            .iter_mut()
            .find(|t| &t.id == turn_id)
            .ok_or_else(|| HistoryError::NotFound(format!("turn {turn_id}")))?;
        turn.payload = payload;
        Ok(())
    }

    async fn list_turns(&self, session_id: &SessionId, query_id: &QueryId) -> Result<Vec<ChatTurn>, HistoryError> {
        Ok(self
            .turns
            .lock()
            .iter()
            .filter(|t| &t.session_id == session_id && &t.query_id == query_id)
            .cloned()
            .collect())
    }

    async fn session_turns(&self, session_id: &SessionId) -> Result<Vec<ChatTurn>, HistoryError> {
        Ok(self
            .turns
            .lock()
            .iter()
            .filter(|t| &t.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCancellationFlags {
    flags: DashMap<SessionId, CancelFlag>,
}

impl MemoryCancellationFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationFlags for MemoryCancellationFlags {
    async fn check(&self, session_id: &SessionId) -> Result<Option<CancelFlag>, FlagError> {
        Ok(self.flags.get(session_id).map(|f| f.clone()))
    }

    async fn set(&self, session_id: &SessionId, cause: Option<String>) -> Result<(), FlagError> {
        self.flags.insert(
            session_id.clone(),
            CancelFlag {
                cause,
                set_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn clear(&self, session_id: &SessionId) -> Result<(), FlagError> {
        self.flags.remove(session_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionModels {
    models: DashMap<SessionId, String>,
}

impl MemorySessionModels {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionModels for MemorySessionModels {
    async fn current_model(&self, session_id: &SessionId) -> Result<Option<String>, HistoryError> {
        Ok(self.models.get(session_id).map(|m| m.clone()))
    }

    async fn set_current_model(&self, session_id: &SessionId, model: &str) -> Result<(), HistoryError> {
        self.models.insert(session_id.clone(), model.to_string());
        Ok(())
    }
}
