use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use tracing::{debug, warn};

use blockrelay_core::broadcast::{BroadcastEntry, BroadcastLog, Offset};
use blockrelay_core::errors::LogError;
use blockrelay_core::ids::QueryId;

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Upper bound on one blocking tail read.
    pub block_timeout: Duration,
    /// End the stream after a record that closes the connection.
    pub stop_at_close: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive transient failures tolerated before giving up.
    pub max_retries: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(5),
            stop_at_close: true,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            max_retries: 8,
        }
    }
}

/// Replay-then-follow consumer of one broadcast stream.
#[derive(Clone)]
pub struct LogReader {
    log: Arc<dyn BroadcastLog>,
    config: ReaderConfig,
}

impl LogReader {
    pub fn new(log: Arc<dyn BroadcastLog>, config: ReaderConfig) -> Self {
        Self { log, config }
    }

    /// Everything currently stored after `after`, without waiting.
    pub async fn replay(&self, stream_id: &QueryId, after: Offset) -> Result<Vec<BroadcastEntry>, EngineError> {
        let mut out = Vec::new();
        let mut cursor = after;
        loop {
            let batch = self
                .log
                .read(stream_id, cursor, None)
                .await
                .map_err(|e| expired_or(stream_id, e))?;
            let Some(last) = batch.last() else {
                return Ok(out);
            };
            cursor = last.offset;
            out.extend(batch);
        }
    }

    /// Entries after `after`: the stored backlog first, then live appends.
    ///
    /// Transient read failures are retried with jittered exponential backoff.
    /// A missing or expired stream ends the sequence with
    /// [`EngineError::StreamExpired`].
    pub fn follow(&self, stream_id: QueryId, after: Offset) -> BoxStream<'static, Result<BroadcastEntry, EngineError>> {
        let state = Follow {
            log: Arc::clone(&self.log),
            config: self.config.clone(),
            stream_id,
            cursor: after,
            pending: VecDeque::new(),
            failures: 0,
            done: false,
        };
        stream::unfold(state, |mut st| async move {
            let item = st.next().await?;
            Some((item, st))
        })
        .boxed()
    }
}

struct Follow {
    log: Arc<dyn BroadcastLog>,
    config: ReaderConfig,
    stream_id: QueryId,
    cursor: Offset,
    pending: VecDeque<BroadcastEntry>,
    failures: u32,
    done: bool,
}

impl Follow {
    async fn next(&mut self) -> Option<Result<BroadcastEntry, EngineError>> {
        loop {
            if self.done {
                return None;
            }
            if let Some(entry) = self.pending.pop_front() {
                if self.config.stop_at_close && closes_stream(&entry) {
                    self.done = true;
                }
                return Some(Ok(entry));
            }

            match self
                .log
                .read(&self.stream_id, self.cursor, Some(self.config.block_timeout))
                .await
            {
                Ok(batch) => {
                    self.failures = 0;
                    if let Some(last) = batch.last() {
                        self.cursor = last.offset;
                    }
                    self.pending.extend(batch);
                }
                Err(e) if e.is_transient() && self.failures < self.config.max_retries => {
                    let delay = self.backoff();
                    self.failures += 1;
                    warn!(
                        stream_id = %self.stream_id,
                        attempt = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient log read failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(expired_or(&self.stream_id, e)));
                }
            }
        }
    }

    fn backoff(&self) -> Duration {
        let base = self
            .config
            .backoff_initial
            .saturating_mul(2u32.saturating_pow(self.failures))
            .min(self.config.backoff_max);
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

fn closes_stream(entry: &BroadcastEntry) -> bool {
    match entry.record() {
        Ok(record) => record.closes_stream(),
        Err(e) => {
            debug!(offset = %entry.offset, error = %e, "undecodable log entry");
            false
        }
    }
}

fn expired_or(stream_id: &QueryId, err: LogError) -> EngineError {
    match err {
        LogError::NotFound(_) => EngineError::StreamExpired {
            stream_id: stream_id.clone(),
        },
        other => EngineError::Log(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroadcastLog;
    use async_trait::async_trait;
    use blockrelay_core::broadcast::{LogConfig, StreamInfo};
    use blockrelay_core::wire::WireRecord;
    use parking_lot::Mutex;

    fn text(t: &str) -> WireRecord {
        WireRecord::TextBlockDelta { text: t.into() }
    }

    async fn seeded(records: &[WireRecord]) -> (Arc<MemoryBroadcastLog>, QueryId) {
        let log = Arc::new(MemoryBroadcastLog::default());
        let q = QueryId::from_raw("q");
        for r in records {
            log.append_record(&q, r).await.unwrap();
        }
        (log, q)
    }

    #[tokio::test]
    async fn resume_has_no_gaps_or_duplicates() {
        let (log, q) = seeded(&[text("a"), text("b"), text("c"), text("d")]).await;
        let reader = LogReader::new(log, ReaderConfig::default());

        let full = reader.replay(&q, Offset::START).await.unwrap();
        assert_eq!(full.len(), 4);

        let seen = &full[..2];
        let rest = reader.replay(&q, seen[1].offset).await.unwrap();
        let mut joined: Vec<_> = seen.to_vec();
        joined.extend(rest);
        assert_eq!(joined, full);
    }

    #[tokio::test]
    async fn follow_replays_then_tails_until_close() {
        let (log, q) = seeded(&[text("a")]).await;
        let reader = LogReader::new(
            log.clone(),
            ReaderConfig {
                block_timeout: Duration::from_millis(50),
                ..ReaderConfig::default()
            },
        );
        let mut follow = reader.follow(q.clone(), Offset::START);

        let first = follow.next().await.unwrap().unwrap();
        assert_eq!(first.record().unwrap(), text("a"));

        let writer = {
            let log = log.clone();
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.append_record(&q, &text("b")).await.unwrap();
                log.append_record(&q, &WireRecord::StreamEndCloseConnection {}).await.unwrap();
                log.append_record(&q, &text("after close")).await.unwrap();
            })
        };

        let rest: Vec<_> = follow.map(|r| r.unwrap().record().unwrap()).collect().await;
        writer.await.unwrap();
        assert_eq!(rest, vec![text("b"), WireRecord::StreamEndCloseConnection {}]);
    }

    #[tokio::test]
    async fn missing_stream_surfaces_expired() {
        let reader = LogReader::new(Arc::new(MemoryBroadcastLog::default()), ReaderConfig::default());
        let items: Vec<_> = reader.follow(QueryId::from_raw("nope"), Offset::START).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(EngineError::StreamExpired { .. })));

        assert!(matches!(
            reader.replay(&QueryId::from_raw("nope"), Offset::START).await,
            Err(EngineError::StreamExpired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_mid_follow_is_terminal() {
        let log = Arc::new(MemoryBroadcastLog::new(LogConfig {
            ttl: Duration::from_secs(2),
            ..LogConfig::default()
        }));
        let q = QueryId::from_raw("q");
        log.append_record(&q, &text("a")).await.unwrap();

        let reader = LogReader::new(
            log,
            ReaderConfig {
                block_timeout: Duration::from_millis(500),
                ..ReaderConfig::default()
            },
        );
        let items: Vec<_> = reader.follow(q, Offset::START).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(EngineError::StreamExpired { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_across_revival_never_skips_silently() {
        let log = Arc::new(MemoryBroadcastLog::new(LogConfig {
            ttl: Duration::from_secs(10),
            ..LogConfig::default()
        }));
        let q = QueryId::from_raw("q");
        for t in ["a", "b", "c", "d"] {
            log.append_record(&q, &text(t)).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        log.append_record(&q, &text("e")).await.unwrap();
        log.append_record(&q, &text("f")).await.unwrap();

        let reader = LogReader::new(log, ReaderConfig::default());
        assert!(matches!(
            reader.replay(&q, Offset(2)).await,
            Err(EngineError::StreamExpired { .. })
        ));
        let rest = reader.replay(&q, Offset(4)).await.unwrap();
        let records: Vec<_> = rest.iter().map(|e| e.record().unwrap()).collect();
        assert_eq!(records, vec![text("e"), text("f")]);
    }

    /// Fails the first `failures` reads with a transient error.
    struct Flaky {
        inner: MemoryBroadcastLog,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl BroadcastLog for Flaky {
        async fn append(&self, stream_id: &QueryId, payload: &str) -> Result<Offset, LogError> {
            self.inner.append(stream_id, payload).await
        }

        async fn read(
            &self,
            stream_id: &QueryId,
            after: Offset,
            block: Option<Duration>,
        ) -> Result<Vec<BroadcastEntry>, LogError> {
            {
                let mut left = self.failures.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(LogError::transient("connection reset"));
                }
            }
            self.inner.read(stream_id, after, block).await
        }

        async fn exists(&self, stream_id: &QueryId) -> Result<bool, LogError> {
            self.inner.exists(stream_id).await
        }

        async fn delete(&self, stream_id: &QueryId) -> Result<bool, LogError> {
            self.inner.delete(stream_id).await
        }

        async fn info(&self, stream_id: &QueryId) -> Result<Option<StreamInfo>, LogError> {
            self.inner.info(stream_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let log = Arc::new(Flaky {
            inner: MemoryBroadcastLog::default(),
            failures: Mutex::new(3),
        });
        let q = QueryId::from_raw("q");
        log.append_record(&q, &text("a")).await.unwrap();
        log.append_record(&q, &WireRecord::StreamEndCloseConnection {}).await.unwrap();

        let reader = LogReader::new(log, ReaderConfig::default());
        let items: Vec<_> = reader.follow(q, Offset::START).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let log = Arc::new(Flaky {
            inner: MemoryBroadcastLog::default(),
            failures: Mutex::new(100),
        });
        let q = QueryId::from_raw("q");
        log.append_record(&q, &text("a")).await.unwrap();

        let reader = LogReader::new(
            log,
            ReaderConfig {
                max_retries: 2,
                ..ReaderConfig::default()
            },
        );
        let items: Vec<_> = reader.follow(q, Offset::START).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(EngineError::Log(_))));
    }
}
