use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::chat::ChatTurn;
use crate::delta::NormalizedDelta;
use crate::errors::ProviderError;
use crate::ids::{QueryId, SessionId};

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<NormalizedDelta, ProviderError>> + Send>>;

/// Input for one model invocation.
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub session_id: SessionId,
    pub query_id: QueryId,
    pub model: String,
    /// Prior turns of the session in creation order.
    pub history: Vec<ChatTurn>,
    pub max_tokens: Option<u32>,
}

/// A model vendor, decoded at the boundary into `NormalizedDelta`s.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Model used when the session has not pinned one.
    fn model(&self) -> &str;

    async fn stream(&self, request: &ModelRequest) -> Result<DeltaStream, ProviderError>;
}
