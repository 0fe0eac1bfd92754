use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use blockrelay_core::delta::{FinishReason, NormalizedDelta};
use blockrelay_core::errors::ProviderError;
use blockrelay_core::provider::{DeltaStream, ModelProvider, ModelRequest};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of deltas (or in-band errors), then end.
    Stream(Vec<Result<NormalizedDelta, ProviderError>>),
    /// Yield the items with a pause before each one.
    Paced(Duration, Vec<Result<NormalizedDelta, ProviderError>>),
    /// Yield the items, then never end.
    Stall(Vec<NormalizedDelta>),
    /// Return an error from the stream() call itself.
    Error(ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn deltas(deltas: Vec<NormalizedDelta>) -> Self {
        Self::Stream(deltas.into_iter().map(Ok).collect())
    }

    /// A single text block ending the turn.
    pub fn text(text: &str) -> Self {
        Self::deltas(vec![
            NormalizedDelta::text(text),
            NormalizedDelta::Finish(FinishReason::EndTurn),
        ])
    }

    /// One tool call per `(id, name, args_json)`, ending with a tool-use finish.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut deltas = Vec::new();
        for (id, name, args) in calls {
            deltas.push(NormalizedDelta::tool_start(*id, *name));
            deltas.push(NormalizedDelta::tool_args(*id, *args));
            deltas.push(NormalizedDelta::tool_end(*id));
        }
        deltas.push(NormalizedDelta::Finish(FinishReason::ToolUse));
        Self::deltas(deltas)
    }

    /// Deltas followed by an in-band provider error.
    pub fn failing(deltas: Vec<NormalizedDelta>, error: ProviderError) -> Self {
        let mut items: Vec<_> = deltas.into_iter().map(Ok).collect();
        items.push(Err(error));
        Self::Stream(items)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    model: String,
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            model: "mock-model".to_string(),
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ModelRequest) -> Result<DeltaStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let Some(response) = self.responses.get(idx).cloned() else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<DeltaStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(items) => return Ok(Box::pin(stream::iter(items))),
            MockResponse::Paced(pause, items) => {
                let paced = stream::iter(items).then(move |item| async move {
                    tokio::time::sleep(pause).await;
                    item
                });
                return Ok(Box::pin(paced));
            }
            MockResponse::Stall(deltas) => {
                let head = stream::iter(deltas.into_iter().map(Ok));
                return Ok(Box::pin(head.chain(stream::pending())));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
