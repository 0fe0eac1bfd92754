use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LogError;
use crate::ids::QueryId;
use crate::wire::WireRecord;

/// Monotonically increasing cursor into one stream. Offsets start at 1;
/// reading after `Offset::START` replays the whole stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    pub const START: Offset = Offset(0);

    pub fn next(self) -> Offset {
        Offset(self.0 + 1)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid offset: {0}")]
pub struct InvalidOffset(String);

impl FromStr for Offset {
    type Err = InvalidOffset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Offset::START);
        }
        trimmed
            .parse::<u64>()
            .map(Offset)
            .map_err(|_| InvalidOffset(s.to_string()))
    }
}

/// One opaque entry of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub offset: Offset,
    pub payload: String,
    pub arrived_at: DateTime<Utc>,
}

impl BroadcastEntry {
    pub fn record(&self) -> Result<WireRecord, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Tuning shared by broadcast log implementations.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Sliding expiry window, refreshed on every append.
    pub ttl: Duration,
    /// How often a blocked reader re-checks storage written by other processes.
    pub poll_interval: Duration,
    /// Maximum entries returned by one read.
    pub batch_limit: usize,
    /// How long an expired stream's last offset is remembered. An append
    /// within this window continues numbering above every offset issued
    /// before expiry.
    pub mark_retention: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
            batch_limit: 512,
            mark_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub length: u64,
    pub last_offset: Offset,
    pub expires_in: Duration,
}

/// Append-only, offset-addressed, per-stream log with a sliding TTL.
///
/// A single producer appends to a stream; any number of consumers read it
/// and all observe the same order. Every append refreshes the TTL of the
/// whole stream. Once the TTL elapses the stream reads as `NotFound`.
///
/// Offsets of one stream id never repeat. An append after expiry revives the
/// stream with its old entries gone and numbering continued, so a reader
/// resuming from an offset issued before the expiry gets `NotFound` instead
/// of silently skipping entries.
#[async_trait]
pub trait BroadcastLog: Send + Sync {
    async fn append(&self, stream_id: &QueryId, payload: &str) -> Result<Offset, LogError>;

    /// Entries strictly after `after`, in append order. When none are
    /// available and `block` is set, waits up to `block` for new entries and
    /// returns an empty batch on timeout.
    async fn read(
        &self,
        stream_id: &QueryId,
        after: Offset,
        block: Option<Duration>,
    ) -> Result<Vec<BroadcastEntry>, LogError>;

    async fn exists(&self, stream_id: &QueryId) -> Result<bool, LogError>;

    /// Returns whether the stream existed.
    async fn delete(&self, stream_id: &QueryId) -> Result<bool, LogError>;

    async fn info(&self, stream_id: &QueryId) -> Result<Option<StreamInfo>, LogError>;

    async fn append_record(&self, stream_id: &QueryId, record: &WireRecord) -> Result<Offset, LogError> {
        let payload = serde_json::to_string(record).map_err(|e| LogError::Backend {
            message: format!("encode {}: {e}", record.type_name()),
            transient: false,
        })?;
        self.append(stream_id, &payload).await
    }
}
