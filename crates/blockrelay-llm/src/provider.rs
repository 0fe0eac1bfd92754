use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Future, Stream};
use reqwest::header::HeaderMap;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use blockrelay_core::delta::NormalizedDelta;
use blockrelay_core::errors::ProviderError;
use blockrelay_core::provider::{DeltaStream, ModelProvider, ModelRequest};

use crate::converter;
use crate::sse::{self, SseDecoder};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streams completions from the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: Option<&str>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %request.model, query_id = %request.query_id))]
    async fn stream(&self, request: &ModelRequest) -> Result<DeltaStream, ProviderError> {
        let body = converter::build_request_body(request, &request.model);

        let resp = self
            .client
            .post(self.messages_url())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            debug!(status, "provider rejected request");
            return Err(ProviderError::from_status(
                self.name(),
                &request.model,
                status,
                body,
                retry_after,
            ));
        }

        let decoder = SseDecoder::new(self.name(), request.model.clone());
        Ok(Box::pin(SseStream::new(resp.bytes_stream(), decoder)))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Wraps a byte stream and yields decoded deltas. If no data arrives within
/// the idle timeout, yields a `StreamInterrupted` error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: SseDecoder,
    /// Raw bytes of the event in progress. Decoded only once complete, so a
    /// character split across network chunks survives.
    buffer: BytesMut,
    pending: VecDeque<Result<NormalizedDelta, ProviderError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        decoder: SseDecoder,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, decoder, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        decoder: SseDecoder,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    fn decode_event(&mut self, raw: &[u8]) {
        let chunk = match std::str::from_utf8(raw) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.pending
                    .push_back(Err(ProviderError::StreamInterrupted(format!("invalid UTF-8 in event stream: {e}"))));
                return;
            }
        };
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            let decoded = self.decoder.decode(&event_type, &data);
            self.pending.extend(decoded);
        }
    }

    fn next_pending(&mut self) -> Option<Result<NormalizedDelta, ProviderError>> {
        let item = self.pending.pop_front()?;
        if item.is_err() {
            self.done = true;
            self.pending.clear();
        }
        Some(item)
    }
}

impl Stream for SseStream {
    type Item = Result<NormalizedDelta, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(item) = self.next_pending() {
            return Poll::Ready(Some(item));
        }
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
                    while let Some(pos) = event_end(&self.buffer) {
                        let event = self.buffer.split_to(pos + 2);
                        self.decode_event(&event);
                    }

                    if let Some(item) = self.next_pending() {
                        return Poll::Ready(Some(item));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProviderError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buffer.is_empty() {
                        let remaining = self.buffer.split();
                        self.decode_event(&remaining);
                    }
                    return Poll::Ready(self.next_pending());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(Err(ProviderError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

fn event_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
