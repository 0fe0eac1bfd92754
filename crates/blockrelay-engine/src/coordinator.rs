use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, instrument, warn};

use blockrelay_core::broadcast::BroadcastLog;
use blockrelay_core::cancel::CancellationFlags;
use blockrelay_core::chat::{Actor, ChatTurn, NewTurn, ToolStatus, TurnMetadata, TurnPayload};
use blockrelay_core::history::ChatHistoryStore;
use blockrelay_core::ids::{QueryId, SessionId};
use blockrelay_core::provider::ModelProvider;
use blockrelay_core::session::SessionModels;
use blockrelay_core::summary::SessionSummarizer;
use blockrelay_core::tools::{ToolExecutor, ToolInvocation, ToolResponse};
use blockrelay_core::wire::WireRecord;
use blockrelay_llm::{ModelCatalog, NormalizerConfig};

use crate::cancellation::MonitorConfig;
use crate::error::EngineError;
use crate::round::{RoundContext, RoundOutcome, RoundRunner};

const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub max_rounds_per_query: u32,
    /// Bounded final wait for the session summary before `QUERY_COMPLETE`.
    pub summary_wait: Duration,
    pub normalizer: NormalizerConfig,
    pub monitor: MonitorConfig,
    pub max_tokens: Option<u32>,
    /// How long a finished query's terminal state stays visible to `state`.
    pub terminal_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_rounds_per_query: 25,
            summary_wait: Duration::from_secs(5),
            normalizer: NormalizerConfig::default(),
            monitor: MonitorConfig::default(),
            max_tokens: None,
            terminal_retention: Duration::from_secs(60),
        }
    }
}

/// Where a query stands in its model/tool cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    AwaitingModel,
    TextOnly,
    WithTools,
    AwaitingToolResults,
    ToolsResolved,
    Failed,
}

impl RoundState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TextOnly | Self::Failed)
    }
}

/// Why a session's model changed between rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    ToolUseFailure,
    Throttling,
    TokenLimitExceeded,
    User,
}

impl SwitchReason {
    fn describe(self) -> &'static str {
        match self {
            Self::ToolUseFailure => "due to tool use failure",
            Self::Throttling => "due to throttling",
            Self::TokenLimitExceeded => "due to token limit exceeded",
            Self::User => "by the user",
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub session_id: SessionId,
    pub query: String,
    /// Model to answer with; defaults to the session's current model.
    pub model: Option<String>,
    /// Why `model` differs from the session's current one, when it does.
    pub switch_reason: Option<SwitchReason>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct QueryHandle {
    pub session_id: SessionId,
    pub query_id: QueryId,
}

/// Drives queries through rounds of model calls and tool resolution.
///
/// A query suspends after a round that requested tools; the pending
/// tool-use turns in the history store are the durable marker. The next
/// round starts once every invocation of the round has a response, no
/// matter in which order they arrive.
pub struct ToolLoopCoordinator {
    runner: RoundRunner,
    history: Arc<dyn ChatHistoryStore>,
    sessions: Arc<dyn SessionModels>,
    flags: Arc<dyn CancellationFlags>,
    executor: Option<Arc<dyn ToolExecutor>>,
    catalog: Arc<ModelCatalog>,
    config: CoordinatorConfig,
    default_model: String,
    /// Latest round number and its state, per query.
    states: DashMap<QueryId, (u32, RoundState)>,
    resume_locks: DashMap<QueryId, Arc<tokio::sync::Mutex<()>>>,
}

impl ToolLoopCoordinator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        history: Arc<dyn ChatHistoryStore>,
        log: Arc<dyn BroadcastLog>,
        flags: Arc<dyn CancellationFlags>,
        sessions: Arc<dyn SessionModels>,
        config: CoordinatorConfig,
    ) -> Self {
        let catalog = Arc::new(ModelCatalog::builtin());
        let default_model = provider.model().to_string();
        let runner = RoundRunner::new(
            provider,
            Arc::clone(&history),
            log,
            Arc::clone(&flags),
            Arc::clone(&catalog),
            config.clone(),
        );
        Self {
            runner,
            history,
            sessions,
            flags,
            executor: None,
            catalog,
            config,
            default_model: if default_model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                default_model
            },
            states: DashMap::new(),
            resume_locks: DashMap::new(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn SessionSummarizer>) -> Self {
        self.runner = self.runner.with_summarizer(summarizer);
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self.runner = self.runner.with_catalog(Arc::clone(&self.catalog));
        self
    }

    pub fn log(&self) -> &Arc<dyn BroadcastLog> {
        self.runner.log()
    }

    pub fn state(&self, query_id: &QueryId) -> Option<RoundState> {
        self.states.get(query_id).map(|s| s.1)
    }

    /// Queries with a round state still held.
    pub fn tracked_queries(&self) -> usize {
        self.states.len()
    }

    /// Persist the user's turn and start the first round. Returns once
    /// `RESPONSE_METADATA` is on the stream; the round runs in the background.
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub async fn start_query(self: &Arc<Self>, request: QueryRequest) -> Result<QueryHandle, EngineError> {
        let query_id = QueryId::new();
        let session_id = request.session_id;

        // A flag left over from an earlier query must not cancel this one.
        if let Err(e) = self.flags.clear(&session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to clear stale cancellation flag");
        }

        let current = self.sessions.current_model(&session_id).await?;
        let model = request
            .model
            .or_else(|| current.clone())
            .unwrap_or_else(|| self.default_model.clone());
        match current {
            Some(_) => {
                let reason = request.switch_reason.unwrap_or(SwitchReason::User);
                self.switch_model(&session_id, &query_id, &model, reason).await?;
            }
            None => self.sessions.set_current_model(&session_id, &model).await?,
        }

        self.history
            .create_turn(NewTurn {
                session_id: session_id.clone(),
                query_id: query_id.clone(),
                actor: Actor::User,
                payload: TurnPayload::Text { text: request.query.clone() },
                metadata: TurnMetadata {
                    llm_model: Some(model.clone()),
                },
            })
            .await?;

        info!(query_id = %query_id, model = %model, "query accepted");
        let ctx = RoundContext {
            session_id: session_id.clone(),
            query_id: query_id.clone(),
            model,
            query_text: Some(request.query),
        };
        self.launch_round(ctx).await?;
        Ok(QueryHandle { session_id, query_id })
    }

    /// Change the session's model. A visible system turn records the swap
    /// before any later round runs. Returns whether the model changed.
    #[instrument(skip(self), fields(session_id = %session_id, query_id = %query_id))]
    pub async fn switch_model(
        &self,
        session_id: &SessionId,
        query_id: &QueryId,
        new_model: &str,
        reason: SwitchReason,
    ) -> Result<bool, EngineError> {
        let current = self.sessions.current_model(session_id).await?;
        if current.as_deref() == Some(new_model) {
            return Ok(false);
        }
        self.sessions.set_current_model(session_id, new_model).await?;
        let Some(previous) = current else {
            return Ok(true);
        };

        let info = format!(
            "LLM model changed from {} to {} {}.",
            self.catalog.display_name(&previous),
            self.catalog.display_name(new_model),
            reason.describe()
        );
        self.history
            .create_turn(NewTurn {
                session_id: session_id.clone(),
                query_id: query_id.clone(),
                actor: Actor::System,
                payload: TurnPayload::Info { info },
                metadata: TurnMetadata {
                    llm_model: Some(new_model.to_string()),
                },
            })
            .await?;
        info!(from = %previous, to = %new_model, ?reason, "model switched");
        Ok(true)
    }

    /// Raise the session's cancellation flag. An active round notices it
    /// within one poll interval.
    pub async fn cancel_session(&self, session_id: &SessionId, cause: Option<String>) -> Result<(), EngineError> {
        self.flags.set(session_id, cause).await?;
        Ok(())
    }

    /// Backfill tool responses for a suspended query. Each tool-use turn
    /// accepts exactly one response. Returns `true` when this call resolved
    /// the last pending invocation and started the next round.
    #[instrument(skip(self, responses), fields(session_id = %session_id, query_id = %query_id, count = responses.len()))]
    pub async fn submit_tool_responses(
        self: &Arc<Self>,
        session_id: &SessionId,
        query_id: &QueryId,
        responses: Vec<ToolResponse>,
    ) -> Result<bool, EngineError> {
        let lock = self.resume_lock(query_id);
        let result = {
            let _held = lock.lock().await;
            self.store_responses(session_id, query_id, responses).await
        };
        drop(lock);
        self.release_lock(query_id);
        result
    }

    async fn store_responses(
        self: &Arc<Self>,
        session_id: &SessionId,
        query_id: &QueryId,
        responses: Vec<ToolResponse>,
    ) -> Result<bool, EngineError> {
        let mut turns = self.history.list_turns(session_id, query_id).await?;
        if turns.is_empty() {
            return Err(EngineError::QueryNotFound(query_id.clone()));
        }

        let mut updates = Vec::with_capacity(responses.len());
        for response in responses {
            let (turn_id, mut payload) = turns
                .iter()
                .find_map(|t| {
                    t.payload
                        .as_tool_use()
                        .filter(|p| p.tool_use_id == response.tool_use_id)
                        .map(|p| (t.id.clone(), p.clone()))
                })
                .ok_or_else(|| EngineError::UnknownToolUse(response.tool_use_id.clone()))?;
            if payload.status.is_resolved() || updates.iter().any(|(id, _)| id == &turn_id) {
                return Err(EngineError::ToolAlreadyResolved(response.tool_use_id));
            }
            payload.status = match response.status {
                ToolStatus::Pending => ToolStatus::Completed,
                other => other,
            };
            payload.tool_response = Some(response.response);
            updates.push((turn_id, payload));
        }
        if updates.is_empty() {
            return Ok(false);
        }

        for (turn_id, payload) in updates {
            debug!(tool_use_id = %payload.tool_use_id, status = ?payload.status, "tool response stored");
            let payload = TurnPayload::ToolUse(payload);
            self.history.update_turn(&turn_id, payload.clone()).await?;
            if let Some(turn) = turns.iter_mut().find(|t| t.id == turn_id) {
                turn.payload = payload;
            }
        }

        // The round is still streaming; it resumes by itself once it ends.
        if self.state(query_id) == Some(RoundState::AwaitingModel) {
            return Ok(false);
        }
        self.resume_if_resolved(session_id, query_id, &turns).await
    }

    /// Start the next round when no tool-use turn of the query is pending.
    /// The caller holds the query's resume lock.
    async fn resume_if_resolved(
        self: &Arc<Self>,
        session_id: &SessionId,
        query_id: &QueryId,
        turns: &[ChatTurn],
    ) -> Result<bool, EngineError> {
        let pending = turns
            .iter()
            .filter_map(|t| t.payload.as_tool_use())
            .filter(|p| !p.status.is_resolved())
            .count();
        if pending > 0 {
            debug!(pending, "waiting on tool responses");
            self.set_latest_state(query_id, RoundState::AwaitingToolResults);
            return Ok(false);
        }

        self.set_latest_state(query_id, RoundState::ToolsResolved);
        let model = self
            .sessions
            .current_model(session_id)
            .await?
            .unwrap_or_else(|| self.default_model.clone());
        let ctx = RoundContext {
            session_id: session_id.clone(),
            query_id: query_id.clone(),
            model,
            query_text: first_user_text(turns),
        };
        self.launch_round(ctx).await?;
        Ok(true)
    }

    fn resume_lock(&self, query_id: &QueryId) -> Arc<tokio::sync::Mutex<()>> {
        self.resume_locks
            .entry(query_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the query's lock once no caller holds a handle to it. The caller
    /// must have dropped its own handle first.
    fn release_lock(&self, query_id: &QueryId) {
        self.resume_locks
            .remove_if(query_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn launch_round(self: &Arc<Self>, ctx: RoundContext) -> Result<(), EngineError> {
        let round = {
            let mut entry = self
                .states
                .entry(ctx.query_id.clone())
                .or_insert((0, RoundState::AwaitingModel));
            entry.0 += 1;
            entry.1 = RoundState::AwaitingModel;
            entry.0
        };
        if round > self.config.max_rounds_per_query {
            let err = EngineError::MaxRoundsExceeded(self.config.max_rounds_per_query);
            self.set_state(&ctx.query_id, round, RoundState::Failed);
            let record = WireRecord::StreamError(err.to_stream_error(ctx.query_text.as_deref()));
            if let Err(e) = self.runner.log().append_record(&ctx.query_id, &record).await {
                warn!(error = %e, "failed to publish stream error");
            }
            self.forget(&ctx.query_id, round);
            return Err(err);
        }

        if let Err(e) = self.runner.announce(&ctx).await {
            self.set_state(&ctx.query_id, round, RoundState::Failed);
            self.forget(&ctx.query_id, round);
            return Err(e);
        }
        debug!(query_id = %ctx.query_id, round, "round scheduled");

        tokio::spawn(Arc::clone(self).complete_round(ctx, round));
        Ok(())
    }

    /// Boxed because a round that resolves its tools launches the next one.
    fn complete_round(self: Arc<Self>, ctx: RoundContext, round: u32) -> BoxFuture<'static, ()> {
        async move { self.finish_round(ctx, round).await }.boxed()
    }

    async fn finish_round(self: Arc<Self>, ctx: RoundContext, round: u32) {
        match self.runner.run(&ctx).await {
            Ok(RoundOutcome::TextOnly { .. }) => {
                self.set_state(&ctx.query_id, round, RoundState::TextOnly);
                self.forget(&ctx.query_id, round);
            }
            Ok(RoundOutcome::WithTools { invocations }) => {
                self.set_state(&ctx.query_id, round, RoundState::WithTools);
                if let Some(executor) = self.executor.clone() {
                    self.set_state(&ctx.query_id, round, RoundState::AwaitingToolResults);
                    for invocation in invocations {
                        self.dispatch(Arc::clone(&executor), ctx.session_id.clone(), ctx.query_id.clone(), invocation);
                    }
                    return;
                }
                // Responses may have been stored while the round was streaming.
                let lock = self.resume_lock(&ctx.query_id);
                let resumed = {
                    let _held = lock.lock().await;
                    if self.is_current(&ctx.query_id, round) {
                        self.set_state(&ctx.query_id, round, RoundState::AwaitingToolResults);
                        match self.history.list_turns(&ctx.session_id, &ctx.query_id).await {
                            Ok(turns) => self.resume_if_resolved(&ctx.session_id, &ctx.query_id, &turns).await,
                            Err(e) => Err(e.into()),
                        }
                    } else {
                        Ok(false)
                    }
                };
                drop(lock);
                self.release_lock(&ctx.query_id);
                if let Err(e) = resumed {
                    warn!(query_id = %ctx.query_id, error = %e, "failed to resume query");
                }
            }
            Err(_) => {
                self.set_state(&ctx.query_id, round, RoundState::Failed);
                self.forget(&ctx.query_id, round);
            }
        }
    }

    fn set_state(&self, query_id: &QueryId, round: u32, state: RoundState) {
        if let Some(mut entry) = self.states.get_mut(query_id) {
            if entry.0 == round {
                entry.1 = state;
            }
        }
    }

    fn is_current(&self, query_id: &QueryId, round: u32) -> bool {
        self.states.get(query_id).is_some_and(|s| s.0 == round)
    }

    fn set_latest_state(&self, query_id: &QueryId, state: RoundState) {
        self.states
            .entry(query_id.clone())
            .and_modify(|entry| entry.1 = state)
            .or_insert((0, state));
    }

    fn dispatch(
        self: &Arc<Self>,
        executor: Arc<dyn ToolExecutor>,
        session_id: SessionId,
        query_id: QueryId,
        invocation: ToolInvocation,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let tool_use_id = invocation.tool_use_id.clone();
            let response = executor.dispatch(&session_id, invocation).await;
            if let Err(e) = this.submit_tool_responses(&session_id, &query_id, vec![response]).await {
                warn!(tool_use_id = %tool_use_id, error = %e, "failed to record tool response");
            }
        });
    }

    /// Drop a finished query's terminal state once the retention window
    /// passes, unless a later round has started.
    fn forget(self: &Arc<Self>, query_id: &QueryId, round: u32) {
        let this = Arc::downgrade(self);
        let query_id = query_id.clone();
        let retention = self.config.terminal_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(this) = this.upgrade() {
                this.states
                    .remove_if(&query_id, |_, (r, state)| *r == round && state.is_terminal());
            }
        });
    }

}

fn first_user_text(turns: &[ChatTurn]) -> Option<String> {
    turns.iter().find_map(|t| match (&t.actor, &t.payload) {
        (Actor::User, TurnPayload::Text { text }) => Some(text.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroadcastLog, MemoryCancellationFlags, MemoryHistory, MemorySessionModels};
    use crate::reader::{LogReader, ReaderConfig};
    use async_trait::async_trait;
    use blockrelay_core::broadcast::Offset;
    use blockrelay_core::ids::ToolUseId;
    use blockrelay_core::wire::ErrorStatus;
    use blockrelay_llm::{MockProvider, MockResponse};
    use futures::StreamExt;
    use serde_json::json;

    struct Fixture {
        provider: Arc<MockProvider>,
        history: Arc<MemoryHistory>,
        log: Arc<MemoryBroadcastLog>,
        sessions: Arc<MemorySessionModels>,
    }

    impl Fixture {
        fn new(responses: Vec<MockResponse>) -> Self {
            Self {
                provider: Arc::new(MockProvider::new(responses).with_model("claude-opus-4-6")),
                history: Arc::new(MemoryHistory::new()),
                log: Arc::new(MemoryBroadcastLog::default()),
                sessions: Arc::new(MemorySessionModels::new()),
            }
        }

        fn coordinator(&self, config: CoordinatorConfig) -> ToolLoopCoordinator {
            ToolLoopCoordinator::new(
                self.provider.clone(),
                self.history.clone(),
                self.log.clone(),
                Arc::new(MemoryCancellationFlags::new()),
                self.sessions.clone(),
                config,
            )
        }

        /// Records of the stream up to and including the next terminal record.
        async fn round_records(&self, query_id: &QueryId, after: Offset) -> (Vec<WireRecord>, Offset) {
            let reader = LogReader::new(
                self.log.clone(),
                ReaderConfig {
                    block_timeout: Duration::from_millis(50),
                    ..ReaderConfig::default()
                },
            );
            let mut follow = reader.follow(query_id.clone(), after);
            let mut out = Vec::new();
            let mut last = after;
            while let Some(entry) = follow.next().await {
                let entry = entry.unwrap();
                last = entry.offset;
                let record = entry.record().unwrap();
                let terminal = record.is_terminal();
                out.push(record);
                if terminal {
                    break;
                }
            }
            (out, last)
        }
    }

    fn query(session: &str, text: &str) -> QueryRequest {
        QueryRequest {
            session_id: SessionId::from_raw(session),
            query: text.into(),
            model: None,
            switch_reason: None,
        }
    }

    fn completed(id: &str, response: serde_json::Value) -> ToolResponse {
        ToolResponse {
            tool_use_id: ToolUseId::from_raw(id),
            status: ToolStatus::Completed,
            response,
        }
    }

    async fn wait_for_state(coordinator: &ToolLoopCoordinator, query_id: &QueryId, want: RoundState) {
        for _ in 0..200 {
            if coordinator.state(query_id) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("query never reached {want:?}, last {:?}", coordinator.state(query_id));
    }

    #[tokio::test]
    async fn text_only_query_completes() {
        let fx = Fixture::new(vec![MockResponse::text("Hello!")]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let handle = coordinator.start_query(query("s", "hi")).await.unwrap();

        let (records, _) = fx.round_records(&handle.query_id, Offset::START).await;
        assert_eq!(records.first().map(|r| r.type_name()), Some("RESPONSE_METADATA"));
        assert!(matches!(
            &records[records.len() - 2],
            WireRecord::QueryComplete { success: true, .. }
        ));
        assert_eq!(records.last(), Some(&WireRecord::StreamEndCloseConnection {}));

        wait_for_state(&coordinator, &handle.query_id, RoundState::TextOnly).await;
        let turns = fx.history.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].actor, Actor::User);
        assert_eq!(turns[1].payload, TurnPayload::Text { text: "Hello!".into() });
        assert_eq!(
            fx.sessions.current_model(&handle.session_id).await.unwrap().as_deref(),
            Some("claude-opus-4-6")
        );
    }

    #[tokio::test]
    async fn next_round_waits_for_every_parallel_tool() {
        let fx = Fixture::new(vec![
            MockResponse::tool_calls(&[("a", "grep", "{\"q\":\"x\"}"), ("b", "read", "{\"p\":\"y\"}")]),
            MockResponse::text("all done"),
        ]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let handle = coordinator.start_query(query("s", "find it")).await.unwrap();

        let (records, last) = fx.round_records(&handle.query_id, Offset::START).await;
        assert_eq!(records.last(), Some(&WireRecord::StreamEnd {}));
        wait_for_state(&coordinator, &handle.query_id, RoundState::AwaitingToolResults).await;

        // Responses arrive in reverse order.
        let resumed = coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("b", json!("file body"))])
            .await
            .unwrap();
        assert!(!resumed);
        assert_eq!(fx.provider.call_count(), 1);

        let resumed = coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("a", json!(["x.rs"]))])
            .await
            .unwrap();
        assert!(resumed);

        let (records, _) = fx.round_records(&handle.query_id, last).await;
        assert_eq!(records[0].type_name(), "RESPONSE_METADATA");
        assert_eq!(records.last(), Some(&WireRecord::StreamEndCloseConnection {}));
        assert_eq!(fx.provider.call_count(), 2);

        let second = &fx.provider.requests()[1];
        let resolved = second
            .history
            .iter()
            .filter_map(|t| t.payload.as_tool_use())
            .filter(|p| p.status == ToolStatus::Completed)
            .count();
        assert_eq!(resolved, 2);
    }

    #[tokio::test]
    async fn concurrent_submissions_resume_exactly_once() {
        let fx = Fixture::new(vec![
            MockResponse::tool_calls(&[("a", "f", "{}"), ("b", "g", "{}")]),
            MockResponse::text("ok"),
        ]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let handle = coordinator.start_query(query("s", "go")).await.unwrap();
        fx.round_records(&handle.query_id, Offset::START).await;
        wait_for_state(&coordinator, &handle.query_id, RoundState::AwaitingToolResults).await;

        let submit = |id: &'static str| {
            let coordinator = Arc::clone(&coordinator);
            let handle = handle.clone();
            tokio::spawn(async move {
                coordinator
                    .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed(id, json!(id))])
                    .await
                    .unwrap()
            })
        };
        let (a, b) = tokio::join!(submit("a"), submit("b"));
        let resumed = [a.unwrap(), b.unwrap()];
        assert_eq!(resumed.iter().filter(|r| **r).count(), 1);
    }

    #[tokio::test]
    async fn responses_during_streaming_resume_at_round_end() {
        use blockrelay_core::delta::{FinishReason, NormalizedDelta};

        let fx = Fixture::new(vec![
            MockResponse::Paced(
                Duration::from_millis(150),
                vec![
                    Ok(NormalizedDelta::tool_start("a", "f")),
                    Ok(NormalizedDelta::tool_args("a", "{}")),
                    Ok(NormalizedDelta::tool_end("a")),
                    Ok(NormalizedDelta::Finish(FinishReason::ToolUse)),
                ],
            ),
            MockResponse::text("after tools"),
        ]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let handle = coordinator.start_query(query("s", "go")).await.unwrap();

        for _ in 0..200 {
            if fx.history.turns().iter().any(|t| t.payload.as_tool_use().is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coordinator.state(&handle.query_id), Some(RoundState::AwaitingModel));
        let resumed = coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("a", json!(1))])
            .await
            .unwrap();
        assert!(!resumed);

        wait_for_state(&coordinator, &handle.query_id, RoundState::TextOnly).await;
        assert_eq!(fx.provider.call_count(), 2);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let fx = Fixture::new(vec![MockResponse::tool_calls(&[("a", "f", "{}"), ("b", "g", "{}")])]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let handle = coordinator.start_query(query("s", "go")).await.unwrap();
        fx.round_records(&handle.query_id, Offset::START).await;
        wait_for_state(&coordinator, &handle.query_id, RoundState::AwaitingToolResults).await;

        let err = coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("zzz", json!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownToolUse(_)));

        coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("a", json!(1))])
            .await
            .unwrap();
        let err = coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("a", json!(2))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolAlreadyResolved(_)));

        let err = coordinator
            .submit_tool_responses(&handle.session_id, &QueryId::from_raw("missing"), vec![completed("a", json!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QueryNotFound(_)));
    }

    #[tokio::test]
    async fn model_swap_records_system_turn() {
        let fx = Fixture::new(vec![MockResponse::text("first"), MockResponse::text("second")]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let first = coordinator.start_query(query("s", "one")).await.unwrap();
        fx.round_records(&first.query_id, Offset::START).await;

        let second = coordinator
            .start_query(QueryRequest {
                model: Some("claude-sonnet-4-5-1m".into()),
                switch_reason: Some(SwitchReason::TokenLimitExceeded),
                ..query("s", "two")
            })
            .await
            .unwrap();
        fx.round_records(&second.query_id, Offset::START).await;

        let info: Vec<_> = fx
            .history
            .turns()
            .into_iter()
            .filter(|t| t.actor == Actor::System)
            .collect();
        assert_eq!(info.len(), 1);
        assert_eq!(
            info[0].payload,
            TurnPayload::Info {
                info: "LLM model changed from Claude Opus 4.6 to Claude Sonnet 4.5 (1M) due to token limit exceeded."
                    .into()
            }
        );
        assert_eq!(info[0].query_id, second.query_id);
        assert_eq!(fx.provider.requests()[1].model, "claude-sonnet-4-5-1m");
    }

    #[tokio::test]
    async fn unchanged_model_is_not_a_switch() {
        let fx = Fixture::new(vec![]);
        let coordinator = fx.coordinator(CoordinatorConfig::default());
        let s = SessionId::from_raw("s");
        let q = QueryId::from_raw("q");
        assert!(coordinator.switch_model(&s, &q, "m1", SwitchReason::User).await.unwrap());
        assert!(!coordinator.switch_model(&s, &q, "m1", SwitchReason::User).await.unwrap());
        assert!(coordinator.switch_model(&s, &q, "m2", SwitchReason::Throttling).await.unwrap());

        let turns = fx.history.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(
            turns[0].payload,
            TurnPayload::Info {
                info: "LLM model changed from m1 to m2 due to throttling.".into()
            }
        );
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn dispatch(&self, _session_id: &SessionId, invocation: ToolInvocation) -> ToolResponse {
            ToolResponse {
                tool_use_id: invocation.tool_use_id,
                status: ToolStatus::Completed,
                response: json!({"echo": invocation.input}),
            }
        }
    }

    #[tokio::test]
    async fn executor_resolves_tools_in_process() {
        let fx = Fixture::new(vec![
            MockResponse::tool_calls(&[("a", "f", "{\"n\":1}"), ("b", "f", "{\"n\":2}")]),
            MockResponse::text("finished"),
        ]);
        let coordinator = Arc::new(
            fx.coordinator(CoordinatorConfig::default())
                .with_executor(Arc::new(EchoExecutor)),
        );
        let handle = coordinator.start_query(query("s", "run")).await.unwrap();
        let (_, last) = fx.round_records(&handle.query_id, Offset::START).await;
        let (records, _) = fx.round_records(&handle.query_id, last).await;
        assert_eq!(records.last(), Some(&WireRecord::StreamEndCloseConnection {}));
        wait_for_state(&coordinator, &handle.query_id, RoundState::TextOnly).await;

        let echoed = fx
            .history
            .turns()
            .into_iter()
            .filter_map(|t| t.payload.as_tool_use().cloned())
            .find(|p| p.tool_use_id.as_str() == "b")
            .unwrap();
        assert_eq!(echoed.tool_response, Some(json!({"echo": {"n": 2}})));
    }

    #[tokio::test]
    async fn round_limit_is_enforced() {
        let fx = Fixture::new(vec![MockResponse::tool_calls(&[("a", "f", "{}")])]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig {
            max_rounds_per_query: 1,
            ..CoordinatorConfig::default()
        }));
        let handle = coordinator.start_query(query("s", "loop")).await.unwrap();
        let (_, last) = fx.round_records(&handle.query_id, Offset::START).await;
        wait_for_state(&coordinator, &handle.query_id, RoundState::AwaitingToolResults).await;

        let err = coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("a", json!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MaxRoundsExceeded(1)));

        let (records, _) = fx.round_records(&handle.query_id, last).await;
        assert!(matches!(&records[0], WireRecord::StreamError(c) if c.status == ErrorStatus::LlmError));
        assert_eq!(coordinator.state(&handle.query_id), Some(RoundState::Failed));
    }

    #[tokio::test]
    async fn finished_queries_are_forgotten() {
        let fx = Fixture::new(vec![
            MockResponse::text("one"),
            MockResponse::tool_calls(&[("a", "f", "{}")]),
        ]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig {
            max_rounds_per_query: 1,
            terminal_retention: Duration::from_millis(30),
            ..CoordinatorConfig::default()
        }));

        let text = coordinator.start_query(query("s1", "hi")).await.unwrap();
        wait_for_state(&coordinator, &text.query_id, RoundState::TextOnly).await;

        let looping = coordinator.start_query(query("s2", "loop")).await.unwrap();
        wait_for_state(&coordinator, &looping.query_id, RoundState::AwaitingToolResults).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.resume_locks.is_empty());
        assert!(coordinator
            .submit_tool_responses(&looping.session_id, &looping.query_id, vec![completed("a", json!(1))])
            .await
            .is_err());
        assert_eq!(coordinator.state(&looping.query_id), Some(RoundState::Failed));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coordinator.tracked_queries(), 0);
        assert!(coordinator.resume_locks.is_empty());
        assert_eq!(coordinator.state(&text.query_id), None);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn round_futures_are_send() {
        let fx = Fixture::new(vec![]);
        let coordinator = Arc::new(fx.coordinator(CoordinatorConfig::default()));
        let ctx = RoundContext {
            session_id: SessionId::from_raw("s"),
            query_id: QueryId::from_raw("q"),
            model: "claude-opus-4-6".into(),
            query_text: None,
        };
        let round = Arc::clone(&coordinator).complete_round(ctx, 1);
        assert_send(&round);
        let start = coordinator.start_query(query("s", "hi"));
        assert_send(&start);
        let qid = QueryId::from_raw("q");
        let sid = SessionId::from_raw("s");
        let submit = coordinator.submit_tool_responses(&sid, &qid, Vec::new());
        assert_send(&submit);
    }

    #[tokio::test]
    async fn runs_against_sqlite_collaborators() {
        use blockrelay_core::broadcast::LogConfig;
        use blockrelay_store::{Database, SessionModelRepo, SqliteBroadcastLog, SqliteCancellationFlags, TurnRepo};

        let db = Database::in_memory().unwrap();
        let log = Arc::new(SqliteBroadcastLog::new(db.clone(), LogConfig::default()));
        let turns = Arc::new(TurnRepo::new(db.clone()));
        let coordinator = Arc::new(ToolLoopCoordinator::new(
            Arc::new(MockProvider::new(vec![
                MockResponse::tool_calls(&[("a", "f", "{\"k\":true}")]),
                MockResponse::text("done"),
            ])),
            turns.clone(),
            log.clone(),
            Arc::new(SqliteCancellationFlags::new(db.clone())),
            Arc::new(SessionModelRepo::new(db)),
            CoordinatorConfig::default(),
        ));

        let handle = coordinator.start_query(query("s", "sqlite")).await.unwrap();
        wait_for_state(&coordinator, &handle.query_id, RoundState::AwaitingToolResults).await;
        assert!(coordinator
            .submit_tool_responses(&handle.session_id, &handle.query_id, vec![completed("a", json!("ok"))])
            .await
            .unwrap());
        wait_for_state(&coordinator, &handle.query_id, RoundState::TextOnly).await;

        let stored = turns.list_for_query(&handle.session_id, &handle.query_id).unwrap();
        assert_eq!(stored.len(), 3);
        let records = LogReader::new(log, ReaderConfig::default())
            .replay(&handle.query_id, Offset::START)
            .await
            .unwrap();
        assert_eq!(
            records.last().unwrap().record().unwrap(),
            WireRecord::StreamEndCloseConnection {}
        );
    }
}
