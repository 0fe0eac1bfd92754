use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use blockrelay_core::blocks::BlockEvent;
use blockrelay_core::broadcast::BroadcastLog;
use blockrelay_core::cancel::CancellationFlags;
use blockrelay_core::chat::TurnPayload;
use blockrelay_core::history::ChatHistoryStore;
use blockrelay_core::ids::{QueryId, SessionId};
use blockrelay_core::provider::{ModelProvider, ModelRequest};
use blockrelay_core::summary::SessionSummarizer;
use blockrelay_core::tools::ToolInvocation;
use blockrelay_core::wire::WireRecord;
use blockrelay_llm::{ModelCatalog, NormalizedStream};

use crate::accumulator::ConversationAccumulator;
use crate::cancellation::{CancellationMonitor, MonitorGuard};
use crate::coordinator::CoordinatorConfig;
use crate::error::EngineError;
use crate::summary::SummaryTask;

/// Identity of one round.
#[derive(Clone, Debug)]
pub struct RoundContext {
    pub session_id: SessionId,
    pub query_id: QueryId,
    pub model: String,
    /// User text that opened the query, echoed on token-limit errors.
    pub query_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoundOutcome {
    /// No tool use; the query is complete.
    TextOnly { summary: Option<String> },
    /// The model requested tools; the query suspends until all respond.
    WithTools { invocations: Vec<ToolInvocation> },
}

/// Runs one model invocation end to end: stream, normalize, accumulate,
/// publish, and finish with exactly one terminal record.
pub struct RoundRunner {
    provider: Arc<dyn ModelProvider>,
    history: Arc<dyn ChatHistoryStore>,
    log: Arc<dyn BroadcastLog>,
    flags: Arc<dyn CancellationFlags>,
    summarizer: Option<Arc<dyn SessionSummarizer>>,
    catalog: Arc<ModelCatalog>,
    config: CoordinatorConfig,
}

impl RoundRunner {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        history: Arc<dyn ChatHistoryStore>,
        log: Arc<dyn BroadcastLog>,
        flags: Arc<dyn CancellationFlags>,
        catalog: Arc<ModelCatalog>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            provider,
            history,
            log,
            flags,
            summarizer: None,
            catalog,
            config,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn SessionSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn log(&self) -> &Arc<dyn BroadcastLog> {
        &self.log
    }

    /// Publish `RESPONSE_METADATA`. Called before the round is scheduled so
    /// the stream exists by the time a client connects.
    pub async fn announce(&self, ctx: &RoundContext) -> Result<(), EngineError> {
        self.publish(
            &ctx.query_id,
            WireRecord::ResponseMetadata {
                query_id: ctx.query_id.clone(),
                session_id: ctx.session_id.clone(),
            },
        )
        .await
    }

    /// Run the round. Failures are published as one `STREAM_ERROR` before
    /// being returned.
    #[instrument(skip(self, ctx), fields(session_id = %ctx.session_id, query_id = %ctx.query_id, model = %ctx.model))]
    pub async fn run(&self, ctx: &RoundContext) -> Result<RoundOutcome, EngineError> {
        let monitor = CancellationMonitor::new(
            Arc::clone(&self.flags),
            ctx.session_id.clone(),
            self.config.monitor.clone(),
        );
        let guard = monitor.start_monitoring();
        let mut acc = ConversationAccumulator::new(
            Arc::clone(&self.history),
            ctx.session_id.clone(),
            ctx.query_id.clone(),
            ctx.model.clone(),
        );

        let result = self.drive(ctx, &guard, &mut acc).await;
        drop(guard);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(e) = acc.force_close().await {
                    warn!(error = %e, "failed to persist partial blocks");
                }
                if err.is_cancelled() {
                    info!("round cancelled");
                } else {
                    warn!(error = %err, "round failed");
                }
                let content = err.to_stream_error(ctx.query_text.as_deref());
                if let Err(e) = self.publish(&ctx.query_id, WireRecord::StreamError(content)).await {
                    warn!(error = %e, "failed to publish stream error");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &RoundContext,
        guard: &MonitorGuard,
        acc: &mut ConversationAccumulator,
    ) -> Result<RoundOutcome, EngineError> {
        let token = guard.token();
        let request = ModelRequest {
            session_id: ctx.session_id.clone(),
            query_id: ctx.query_id.clone(),
            model: ctx.model.clone(),
            history: self.history.session_turns(&ctx.session_id).await?,
            max_tokens: self.config.max_tokens,
        };

        let upstream = tokio::select! {
            biased;
            () = token.cancelled() => return Err(EngineError::Cancelled { cause: guard.cause() }),
            res = self.provider.stream(&request) => {
                res.map_err(|e| EngineError::from_provider(e, &self.catalog))?
            }
        };

        let mut stream = NormalizedStream::new(upstream, self.config.normalizer.clone(), token);
        let usage = stream.usage_handle();
        let mut summary: Option<SummaryTask> = None;

        while let Some(item) = stream.next().await {
            let event = item.map_err(|e| EngineError::from_normalize(e, &self.catalog, guard.cause()))?;
            let written = acc.accept(&event).await?;
            let closes_text = matches!(event, BlockEvent::TextEnd);
            self.publish(&ctx.query_id, WireRecord::from(event)).await?;

            if acc.tool_use_detected() {
                summary = None;
            } else if closes_text && summary.is_none() && written.is_some() {
                summary = self.launch_summary(&ctx.session_id).await;
            }
            if let Some(text) = summary.as_mut().and_then(SummaryTask::try_take) {
                self.publish(&ctx.query_id, WireRecord::SessionSummary { summary: text })
                    .await?;
            }
        }

        if let Some(u) = usage.get() {
            info!(
                input_tokens = u.input_tokens,
                output_tokens = u.output_tokens,
                cache_read_tokens = u.cache_read_tokens,
                cache_creation_tokens = u.cache_creation_tokens,
                "round usage"
            );
        }

        if acc.tool_use_detected() {
            self.publish(&ctx.query_id, WireRecord::StreamEnd {}).await?;
            return Ok(RoundOutcome::WithTools {
                invocations: acc.invocations().to_vec(),
            });
        }

        if summary.is_none() {
            summary = self.launch_summary(&ctx.session_id).await;
        }
        if let Some(task) = summary.as_mut() {
            if let Some(text) = task.finish(self.config.summary_wait).await {
                self.publish(&ctx.query_id, WireRecord::SessionSummary { summary: text })
                    .await?;
            }
        }
        let final_summary = summary.as_ref().and_then(|t| t.summary()).map(str::to_string);

        self.publish(
            &ctx.query_id,
            WireRecord::QueryComplete {
                query_id: ctx.query_id.clone(),
                success: true,
                summary: final_summary.clone(),
            },
        )
        .await?;
        self.publish(&ctx.query_id, WireRecord::StreamEndCloseConnection {})
            .await?;
        Ok(RoundOutcome::TextOnly { summary: final_summary })
    }

    async fn launch_summary(&self, session_id: &SessionId) -> Option<SummaryTask> {
        let summarizer = self.summarizer.as_ref()?;
        match self.history.session_turns(session_id).await {
            Ok(turns) => {
                let turns = turns
                    .into_iter()
                    .filter(|t| matches!(t.payload, TurnPayload::Text { .. }))
                    .collect();
                Some(SummaryTask::spawn(Arc::clone(summarizer), session_id.clone(), turns))
            }
            Err(e) => {
                warn!(error = %e, "skipping summary, history unavailable");
                None
            }
        }
    }

    async fn publish(&self, query_id: &QueryId, record: WireRecord) -> Result<(), EngineError> {
        let kind = record.type_name();
        let offset = self.log.append_record(query_id, &record).await?;
        debug!(query_id = %query_id, %offset, kind, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroadcastLog, MemoryCancellationFlags, MemoryHistory};
    use async_trait::async_trait;
    use blockrelay_core::broadcast::Offset;
    use blockrelay_core::chat::ChatTurn;
    use blockrelay_core::delta::{FinishReason, NormalizedDelta};
    use blockrelay_core::errors::ProviderError;
    use blockrelay_core::wire::ErrorStatus;
    use blockrelay_llm::{MockProvider, MockResponse};
    use std::time::Duration;

    struct Fixture {
        history: Arc<MemoryHistory>,
        log: Arc<MemoryBroadcastLog>,
        flags: Arc<MemoryCancellationFlags>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                history: Arc::new(MemoryHistory::new()),
                log: Arc::new(MemoryBroadcastLog::default()),
                flags: Arc::new(MemoryCancellationFlags::new()),
            }
        }

        fn runner(&self, responses: Vec<MockResponse>) -> RoundRunner {
            RoundRunner::new(
                Arc::new(MockProvider::new(responses)),
                self.history.clone(),
                self.log.clone(),
                self.flags.clone(),
                Arc::new(ModelCatalog::builtin()),
                CoordinatorConfig {
                    summary_wait: Duration::from_secs(1),
                    ..CoordinatorConfig::default()
                },
            )
        }

        async fn records(&self) -> Vec<WireRecord> {
            self.log
                .read(&QueryId::from_raw("q"), Offset::START, None)
                .await
                .unwrap()
                .iter()
                .map(|e| e.record().unwrap())
                .collect()
        }
    }

    fn ctx() -> RoundContext {
        RoundContext {
            session_id: SessionId::from_raw("s"),
            query_id: QueryId::from_raw("q"),
            model: "claude-opus-4-6".into(),
            query_text: Some("hello".into()),
        }
    }

    struct EchoSummarizer;

    #[async_trait]
    impl SessionSummarizer for EchoSummarizer {
        async fn summarize(&self, _session_id: &SessionId, turns: &[ChatTurn]) -> Result<String, ProviderError> {
            Ok(format!("summary of {} turns", turns.len()))
        }
    }

    #[tokio::test]
    async fn text_round_completes_and_closes() {
        let fx = Fixture::new();
        let runner = fx.runner(vec![MockResponse::text("Hi there")]);
        runner.announce(&ctx()).await.unwrap();
        let outcome = runner.run(&ctx()).await.unwrap();
        assert_eq!(outcome, RoundOutcome::TextOnly { summary: None });

        let records = fx.records().await;
        let types: Vec<_> = records.iter().map(|r| r.type_name()).collect();
        assert_eq!(
            types,
            vec![
                "RESPONSE_METADATA",
                "TEXT_BLOCK_START",
                "TEXT_BLOCK_DELTA",
                "TEXT_BLOCK_END",
                "QUERY_COMPLETE",
                "STREAM_END_CLOSE_CONNECTION",
            ]
        );
        assert_eq!(fx.history.turns().len(), 1);
    }

    #[tokio::test]
    async fn tool_round_ends_with_stream_end() {
        let fx = Fixture::new();
        let runner = fx.runner(vec![MockResponse::tool_calls(&[("t1", "grep", "{\"q\":1}")])]);
        let outcome = runner.run(&ctx()).await.unwrap();
        let RoundOutcome::WithTools { invocations } = outcome else {
            panic!("expected tools");
        };
        assert_eq!(invocations.len(), 1);
        assert_eq!(fx.records().await.last(), Some(&WireRecord::StreamEnd {}));
    }

    #[tokio::test]
    async fn summary_is_published_before_completion() {
        let fx = Fixture::new();
        let runner = fx
            .runner(vec![MockResponse::text("done")])
            .with_summarizer(Arc::new(EchoSummarizer));
        let outcome = runner.run(&ctx()).await.unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::TextOnly {
                summary: Some("summary of 1 turns".into())
            }
        );

        let records = fx.records().await;
        let summaries = records
            .iter()
            .filter(|r| matches!(r, WireRecord::SessionSummary { .. }))
            .count();
        assert_eq!(summaries, 1);
        assert!(matches!(
            &records[records.len() - 2],
            WireRecord::QueryComplete { summary: Some(_), success: true, .. }
        ));
    }

    #[tokio::test]
    async fn throttling_publishes_one_stream_error() {
        let fx = Fixture::new();
        let runner = fx.runner(vec![MockResponse::failing(
            vec![NormalizedDelta::text("partial")],
            ProviderError::Throttled {
                provider: "mock".into(),
                model: "claude-opus-4-6".into(),
                retry_after: Some(Duration::from_secs(3)),
                detail: "slow down".into(),
                region: None,
            },
        )]);
        let err = runner.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::Throttled { .. }));

        let records = fx.records().await;
        let errors: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                WireRecord::StreamError(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, ErrorStatus::LlmThrottled);
        assert_eq!(errors[0].details["retry_after"], 3);
        // The partial text block is kept.
        assert_eq!(fx.history.turns()[0].payload, TurnPayload::Text { text: "partial".into() });
    }

    #[tokio::test]
    async fn malformed_tool_arguments_fail_the_round() {
        let fx = Fixture::new();
        let runner = fx.runner(vec![MockResponse::tool_calls(&[("t1", "grep", "{\"q\":")])]);
        let err = runner.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedToolArguments { .. }));
        let last = fx.records().await.pop().unwrap();
        assert!(matches!(last, WireRecord::StreamError(ref c) if c.status == ErrorStatus::MalformedToolArguments));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_stream_stops_generation() {
        let fx = Fixture::new();
        let runner = fx.runner(vec![MockResponse::Stall(vec![
            NormalizedDelta::text("thinking about it"),
        ])]);
        let flags = fx.flags.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flags.set(&SessionId::from_raw("s"), Some("user".into())).await.unwrap();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), runner.run(&ctx()))
            .await
            .expect("round stops")
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { cause: Some(ref c) } if c == "user"));

        let records = fx.records().await;
        assert_eq!(
            records
                .iter()
                .filter(|r| matches!(r, WireRecord::StreamError(c) if c.status == ErrorStatus::Cancelled))
                .count(),
            1
        );
        assert!(fx.flags.check(&SessionId::from_raw("s")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finish_reason_without_blocks_still_completes() {
        let fx = Fixture::new();
        let runner = fx.runner(vec![MockResponse::deltas(vec![NormalizedDelta::Finish(FinishReason::EndTurn)])]);
        assert!(matches!(runner.run(&ctx()).await.unwrap(), RoundOutcome::TextOnly { .. }));
        assert!(fx.history.turns().is_empty());
    }
}
