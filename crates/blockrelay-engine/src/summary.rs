use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use blockrelay_core::chat::{Actor, ChatTurn, TurnMetadata, TurnPayload};
use blockrelay_core::delta::NormalizedDelta;
use blockrelay_core::errors::ProviderError;
use blockrelay_core::ids::{SessionId, TurnId};
use blockrelay_core::provider::{ModelProvider, ModelRequest};
use blockrelay_core::summary::SessionSummarizer;

const SUMMARY_INSTRUCTION: &str =
    "Summarize this conversation in one short sentence suitable as a title. Reply with the summary only.";

/// Handle to a detached summary generation.
///
/// The result is surfaced at most once through [`try_take`](Self::try_take)
/// or [`finish`](Self::finish); afterwards it stays readable via
/// [`summary`](Self::summary).
pub struct SummaryTask {
    handle: Option<JoinHandle<Result<String, ProviderError>>>,
    summary: Option<String>,
}

impl SummaryTask {
    pub fn spawn(summarizer: Arc<dyn SessionSummarizer>, session_id: SessionId, turns: Vec<ChatTurn>) -> Self {
        let handle = tokio::spawn(async move { summarizer.summarize(&session_id, &turns).await });
        Self {
            handle: Some(handle),
            summary: None,
        }
    }

    /// Drain the result if the task already completed. Never waits.
    pub fn try_take(&mut self) -> Option<String> {
        let handle = self.handle.as_mut()?;
        if !handle.is_finished() {
            return None;
        }
        let outcome = handle.now_or_never()?;
        self.handle = None;
        self.accept(outcome)
    }

    /// Wait at most `budget` for a result not yet taken. The task is aborted
    /// when the budget runs out.
    pub async fn finish(&mut self, budget: Duration) -> Option<String> {
        let mut handle = self.handle.take()?;
        match tokio::time::timeout(budget, &mut handle).await {
            Ok(outcome) => self.accept(outcome),
            Err(_) => {
                debug!(budget_ms = budget.as_millis() as u64, "summary not ready in time");
                handle.abort();
                None
            }
        }
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    fn accept(&mut self, outcome: Result<Result<String, ProviderError>, tokio::task::JoinError>) -> Option<String> {
        match outcome {
            Ok(Ok(summary)) => {
                self.summary = Some(summary.clone());
                Some(summary)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "summary generation failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "summary task did not complete");
                None
            }
        }
    }
}

impl Drop for SummaryTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Summarizer that asks a model for a one-line title of the transcript.
pub struct ModelSummarizer {
    provider: Arc<dyn ModelProvider>,
    model: String,
    max_chars: usize,
}

impl ModelSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_chars: 120,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl SessionSummarizer for ModelSummarizer {
    async fn summarize(&self, session_id: &SessionId, turns: &[ChatTurn]) -> Result<String, ProviderError> {
        let query_id = turns.last().map(|t| t.query_id.clone()).unwrap_or_default();
        let mut history = turns.to_vec();
        history.push(ChatTurn {
            id: TurnId::new(),
            session_id: session_id.clone(),
            query_id: query_id.clone(),
            actor: Actor::User,
            payload: TurnPayload::Text {
                text: SUMMARY_INSTRUCTION.to_string(),
            },
            metadata: TurnMetadata::default(),
            created_at: Utc::now(),
        });
        let request = ModelRequest {
            session_id: session_id.clone(),
            query_id,
            model: self.model.clone(),
            history,
            max_tokens: Some(64),
        };

        let mut stream = self.provider.stream(&request).await?;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            match delta? {
                NormalizedDelta::Text { fragment } => text.push_str(&fragment),
                NormalizedDelta::Finish(_) => break,
                _ => {}
            }
        }

        let summary: String = text.trim().chars().take(self.max_chars).collect();
        if summary.is_empty() {
            return Err(ProviderError::InvalidRequest("model returned an empty summary".into()));
        }
        Ok(summary)
    }
}
