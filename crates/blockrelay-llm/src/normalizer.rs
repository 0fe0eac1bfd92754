use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use blockrelay_core::blocks::{BlockEvent, BlockKind};
use blockrelay_core::delta::{FinishReason, NormalizedDelta};
use blockrelay_core::errors::ProviderError;
use blockrelay_core::ids::ToolUseId;
use blockrelay_core::provider::DeltaStream;
use blockrelay_core::usage::TokenUsage;

#[derive(Clone, Debug)]
pub struct NormalizerConfig {
    /// Maximum number of same-block deltas merged into one emitted delta.
    pub batch_size: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { batch_size: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text,
    Thinking,
    Code { file_path: Option<String> },
    /// Tool calls started and not yet ended, in start order.
    ToolSet(Vec<ToolUseId>),
}

/// Converts `NormalizedDelta`s into block events with explicit boundaries.
///
/// Tracks one open block. Content of a different kind closes the open block
/// before the new one starts. Tool calls form a set that may interleave by
/// id; any text, thinking or code content closes the whole set first.
pub struct BlockNormalizer {
    batch_size: usize,
    open: OpenBlock,
    pending: Option<BlockEvent>,
    pending_count: usize,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl BlockNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            open: OpenBlock::None,
            pending: None,
            pending_count: 0,
            usage: TokenUsage::default(),
            finish_reason: None,
        }
    }

    pub fn push(&mut self, delta: NormalizedDelta) -> Vec<BlockEvent> {
        let mut out = Vec::new();
        match delta {
            NormalizedDelta::Text { fragment } => {
                if fragment.is_empty() {
                    return out;
                }
                if self.open != OpenBlock::Text {
                    self.close_open(&mut out);
                    self.open = OpenBlock::Text;
                    out.push(BlockEvent::TextStart);
                }
                self.emit_delta(&mut out, BlockEvent::TextDelta { text: fragment });
            }
            NormalizedDelta::Thinking { fragment } => {
                if fragment.is_empty() {
                    return out;
                }
                if self.open != OpenBlock::Thinking {
                    self.close_open(&mut out);
                    self.open = OpenBlock::Thinking;
                    out.push(BlockEvent::ThinkingStart);
                }
                self.emit_delta(&mut out, BlockEvent::ThinkingDelta { thinking: fragment });
            }
            NormalizedDelta::Code {
                language,
                file_path,
                fragment,
                diff,
            } => {
                let same_block = matches!(&self.open, OpenBlock::Code { file_path: open } if *open == file_path);
                if !same_block {
                    self.close_open(&mut out);
                    self.open = OpenBlock::Code {
                        file_path: file_path.clone(),
                    };
                    out.push(BlockEvent::CodeStart { language, file_path });
                }
                if !fragment.is_empty() || !diff.is_empty() {
                    self.emit_delta(&mut out, BlockEvent::CodeDelta { code: fragment, diff });
                }
            }
            NormalizedDelta::ToolStart { tool_use_id, tool_name } => {
                self.start_tool(&mut out, tool_use_id, tool_name);
            }
            NormalizedDelta::ToolArgs { tool_use_id, fragment } => {
                if fragment.is_empty() {
                    return out;
                }
                match self.resolve_tool(tool_use_id.as_ref()) {
                    Some(id) => self.emit_delta(
                        &mut out,
                        BlockEvent::ToolUseDelta {
                            tool_use_id: id,
                            fragment,
                        },
                    ),
                    None => warn!(tool_use_id = ?tool_use_id, "dropping argument fragment for unknown tool call"),
                }
            }
            NormalizedDelta::ToolEnd { tool_use_id } => {
                if let Some(id) = self.resolve_tool(tool_use_id.as_ref()) {
                    self.end_tool(&mut out, &id);
                }
            }
            NormalizedDelta::Usage(usage) => {
                self.usage.merge_cumulative(usage);
            }
            NormalizedDelta::Finish(reason) => {
                debug!(reason = ?reason, "provider finished");
                self.finish_reason = Some(reason);
                self.close_open(&mut out);
            }
        }
        out
    }

    /// Close every open block. Called once the upstream is exhausted.
    pub fn finish(&mut self) -> Vec<BlockEvent> {
        let mut out = Vec::new();
        self.close_open(&mut out);
        out
    }

    /// Emit any coalesced delta without closing blocks.
    pub fn flush(&mut self) -> Vec<BlockEvent> {
        let mut out = Vec::new();
        self.flush_pending(&mut out);
        out
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish_reason.as_ref()
    }

    pub fn open_block(&self) -> Option<BlockKind> {
        match self.open {
            OpenBlock::None => None,
            OpenBlock::Text => Some(BlockKind::Text),
            OpenBlock::Thinking => Some(BlockKind::Thinking),
            OpenBlock::Code { .. } => Some(BlockKind::Code),
            OpenBlock::ToolSet(_) => Some(BlockKind::ToolUse),
        }
    }

    fn start_tool(&mut self, out: &mut Vec<BlockEvent>, tool_use_id: ToolUseId, tool_name: String) {
        if matches!(&self.open, OpenBlock::ToolSet(ids) if ids.contains(&tool_use_id)) {
            warn!(tool_use_id = %tool_use_id, "duplicate tool start ignored");
            return;
        }
        if matches!(self.open, OpenBlock::ToolSet(_)) {
            self.flush_pending(out);
        } else {
            self.close_open(out);
            self.open = OpenBlock::ToolSet(Vec::new());
        }
        if let OpenBlock::ToolSet(ids) = &mut self.open {
            ids.push(tool_use_id.clone());
        }
        out.push(BlockEvent::ToolUseStart { tool_use_id, tool_name });
    }

    fn end_tool(&mut self, out: &mut Vec<BlockEvent>, id: &ToolUseId) {
        self.flush_pending(out);
        if let OpenBlock::ToolSet(ids) = &mut self.open {
            ids.retain(|open| open != id);
            if ids.is_empty() {
                self.open = OpenBlock::None;
            }
        }
        out.push(BlockEvent::ToolUseEnd {
            tool_use_id: id.clone(),
        });
    }

    /// An explicit id must name an open tool call; no id means the most
    /// recently started one.
    fn resolve_tool(&self, id: Option<&ToolUseId>) -> Option<ToolUseId> {
        let OpenBlock::ToolSet(ids) = &self.open else {
            return None;
        };
        match id {
            Some(id) => ids.iter().find(|open| *open == id).cloned(),
            None => ids.last().cloned(),
        }
    }

    fn emit_delta(&mut self, out: &mut Vec<BlockEvent>, event: BlockEvent) {
        match self.pending.as_mut() {
            Some(pending) => match pending.coalesce(event) {
                Ok(()) => self.pending_count += 1,
                Err(event) => {
                    self.flush_pending(out);
                    self.pending = Some(event);
                    self.pending_count = 1;
                }
            },
            None => {
                self.pending = Some(event);
                self.pending_count = 1;
            }
        }
        if self.pending_count >= self.batch_size {
            self.flush_pending(out);
        }
    }

    fn flush_pending(&mut self, out: &mut Vec<BlockEvent>) {
        if let Some(event) = self.pending.take() {
            out.push(event);
        }
        self.pending_count = 0;
    }

    fn close_open(&mut self, out: &mut Vec<BlockEvent>) {
        self.flush_pending(out);
        match std::mem::replace(&mut self.open, OpenBlock::None) {
            OpenBlock::None => {}
            OpenBlock::Text => out.push(BlockEvent::TextEnd),
            OpenBlock::Thinking => out.push(BlockEvent::ThinkingEnd),
            OpenBlock::Code { .. } => out.push(BlockEvent::CodeEnd),
            OpenBlock::ToolSet(ids) => {
                out.extend(ids.into_iter().map(|tool_use_id| BlockEvent::ToolUseEnd { tool_use_id }));
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Token usage of a normalized stream, available once it is exhausted.
#[derive(Clone, Debug)]
pub struct UsageHandle {
    rx: watch::Receiver<Option<TokenUsage>>,
}

impl UsageHandle {
    pub fn get(&self) -> Option<TokenUsage> {
        *self.rx.borrow()
    }
}

/// Lazily normalizes a provider stream, consulting a cancellation token
/// before every upstream poll.
///
/// A provider error ends the stream: pending coalesced deltas are flushed,
/// then the error is yielded. Open blocks are left open; the consumer decides
/// whether to force-close them.
pub struct NormalizedStream {
    inner: DeltaStream,
    normalizer: BlockNormalizer,
    ready: VecDeque<BlockEvent>,
    error: Option<NormalizeError>,
    done: bool,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    usage_tx: watch::Sender<Option<TokenUsage>>,
}

impl NormalizedStream {
    pub fn new(inner: DeltaStream, config: NormalizerConfig, cancel: CancellationToken) -> Self {
        let (usage_tx, _) = watch::channel(None);
        Self {
            inner,
            normalizer: BlockNormalizer::new(config),
            ready: VecDeque::new(),
            error: None,
            done: false,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            usage_tx,
        }
    }

    pub fn usage_handle(&self) -> UsageHandle {
        UsageHandle {
            rx: self.usage_tx.subscribe(),
        }
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.normalizer.finish_reason()
    }

    fn cancel_now(&mut self) -> Poll<Option<Result<BlockEvent, NormalizeError>>> {
        self.done = true;
        self.ready.clear();
        self.error = None;
        Poll::Ready(Some(Err(NormalizeError::Cancelled)))
    }
}

impl Stream for NormalizedStream {
    type Item = Result<BlockEvent, NormalizeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done && self.ready.is_empty() && self.error.is_none() {
                return Poll::Ready(None);
            }
            if self.cancel.is_cancelled() {
                if self.done && self.ready.is_empty() && self.error.is_none() {
                    return Poll::Ready(None);
                }
                return self.cancel_now();
            }
            if let Some(event) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if let Some(err) = self.error.take() {
                return Poll::Ready(Some(Err(err)));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(delta))) => {
                    let events = self.normalizer.push(delta);
                    self.ready.extend(events);
                }
                Poll::Ready(Some(Err(err))) => {
                    let events = self.normalizer.flush();
                    self.ready.extend(events);
                    self.error = Some(NormalizeError::Provider(err));
                    self.done = true;
                    let usage = self.normalizer.usage();
                    self.usage_tx.send_replace(Some(usage));
                }
                Poll::Ready(None) => {
                    let events = self.normalizer.finish();
                    self.ready.extend(events);
                    self.done = true;
                    let usage = self.normalizer.usage();
                    self.usage_tx.send_replace(Some(usage));
                }
                Poll::Pending => {
                    if self.cancelled.as_mut().poll(cx).is_ready() {
                        return self.cancel_now();
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::SseDecoder;
    use futures::StreamExt;
    use std::time::Duration;

    fn run(deltas: Vec<NormalizedDelta>) -> Vec<BlockEvent> {
        run_with(deltas, NormalizerConfig::default())
    }

    fn run_with(deltas: Vec<NormalizedDelta>, config: NormalizerConfig) -> Vec<BlockEvent> {
        let mut n = BlockNormalizer::new(config);
        let mut out = Vec::new();
        for d in deltas {
            out.extend(n.push(d));
        }
        out.extend(n.finish());
        out
    }

    fn tid(s: &str) -> ToolUseId {
        ToolUseId::from_raw(s)
    }

    #[test]
    fn text_then_tool_call() {
        let events = run(vec![
            NormalizedDelta::text("Hello"),
            NormalizedDelta::tool_start("1", "f"),
            NormalizedDelta::tool_args("1", "{\"a\":"),
            NormalizedDelta::tool_args("1", "1}"),
            NormalizedDelta::tool_end("1"),
        ]);
        assert_eq!(
            events,
            vec![
                BlockEvent::TextStart,
                BlockEvent::TextDelta { text: "Hello".into() },
                BlockEvent::TextEnd,
                BlockEvent::ToolUseStart {
                    tool_use_id: tid("1"),
                    tool_name: "f".into()
                },
                BlockEvent::ToolUseDelta {
                    tool_use_id: tid("1"),
                    fragment: "{\"a\":".into()
                },
                BlockEvent::ToolUseDelta {
                    tool_use_id: tid("1"),
                    fragment: "1}".into()
                },
                BlockEvent::ToolUseEnd { tool_use_id: tid("1") },
            ]
        );
    }

    #[test]
    fn kind_switch_synthesizes_end() {
        let events = run(vec![
            NormalizedDelta::thinking("hmm"),
            NormalizedDelta::text("answer"),
            NormalizedDelta::thinking("again"),
        ]);
        assert_eq!(
            events,
            vec![
                BlockEvent::ThinkingStart,
                BlockEvent::ThinkingDelta { thinking: "hmm".into() },
                BlockEvent::ThinkingEnd,
                BlockEvent::TextStart,
                BlockEvent::TextDelta { text: "answer".into() },
                BlockEvent::TextEnd,
                BlockEvent::ThinkingStart,
                BlockEvent::ThinkingDelta { thinking: "again".into() },
                BlockEvent::ThinkingEnd,
            ]
        );
    }

    #[test]
    fn never_two_starts_of_same_kind_without_end() {
        let deltas = vec![
            NormalizedDelta::text("a"),
            NormalizedDelta::text("b"),
            NormalizedDelta::Code {
                language: Some("rust".into()),
                file_path: Some("a.rs".into()),
                fragment: "fn".into(),
                diff: String::new(),
            },
            NormalizedDelta::Code {
                language: Some("rust".into()),
                file_path: Some("b.rs".into()),
                fragment: "fn".into(),
                diff: String::new(),
            },
            NormalizedDelta::tool_start("x", "t"),
            NormalizedDelta::text("c"),
            NormalizedDelta::thinking("d"),
            NormalizedDelta::Finish(FinishReason::EndTurn),
            NormalizedDelta::text("e"),
        ];
        let events = run(deltas);
        let mut open: Option<BlockKind> = None;
        for ev in &events {
            if ev.is_start() && ev.kind() != BlockKind::ToolUse {
                assert!(open.is_none(), "start {ev:?} while {open:?} open");
                open = Some(ev.kind());
            }
            if ev.is_end() && ev.kind() != BlockKind::ToolUse {
                assert_eq!(open, Some(ev.kind()));
                open = None;
            }
        }
        assert!(open.is_none());
    }

    #[test]
    fn parallel_tools_interleave_by_id() {
        let events = run(vec![
            NormalizedDelta::tool_start("a", "read"),
            NormalizedDelta::tool_start("b", "write"),
            NormalizedDelta::tool_args("a", "{}"),
            NormalizedDelta::tool_args("b", "{}"),
            NormalizedDelta::tool_end("b"),
            NormalizedDelta::tool_end("a"),
        ]);
        assert_eq!(events.len(), 6);
        assert_eq!(events[4], BlockEvent::ToolUseEnd { tool_use_id: tid("b") });
        assert_eq!(events[5], BlockEvent::ToolUseEnd { tool_use_id: tid("a") });
    }

    #[test]
    fn text_closes_open_tool_set() {
        let events = run(vec![
            NormalizedDelta::tool_start("a", "read"),
            NormalizedDelta::tool_start("b", "read"),
            NormalizedDelta::text("done"),
        ]);
        assert_eq!(
            &events[2..5],
            &[
                BlockEvent::ToolUseEnd { tool_use_id: tid("a") },
                BlockEvent::ToolUseEnd { tool_use_id: tid("b") },
                BlockEvent::TextStart,
            ]
        );
    }

    #[test]
    fn args_without_id_go_to_latest_tool() {
        let events = run(vec![
            NormalizedDelta::tool_start("a", "read"),
            NormalizedDelta::ToolArgs {
                tool_use_id: None,
                fragment: "{}".into(),
            },
            NormalizedDelta::ToolEnd { tool_use_id: None },
        ]);
        assert_eq!(
            events[1],
            BlockEvent::ToolUseDelta {
                tool_use_id: tid("a"),
                fragment: "{}".into()
            }
        );
        assert_eq!(events[2], BlockEvent::ToolUseEnd { tool_use_id: tid("a") });
    }

    #[test]
    fn orphan_tool_fragments_are_dropped() {
        let events = run(vec![
            NormalizedDelta::tool_args("ghost", "{}"),
            NormalizedDelta::tool_end("ghost"),
        ]);
        assert!(events.is_empty());
    }

    #[test]
    fn finish_tool_use_closes_open_tools() {
        let mut n = BlockNormalizer::new(NormalizerConfig::default());
        n.push(NormalizedDelta::tool_start("a", "read"));
        let out = n.push(NormalizedDelta::Finish(FinishReason::ToolUse));
        assert_eq!(out, vec![BlockEvent::ToolUseEnd { tool_use_id: tid("a") }]);
        assert_eq!(n.finish_reason(), Some(&FinishReason::ToolUse));
        assert!(n.open_block().is_none());
        assert!(n.finish().is_empty());
    }

    #[test]
    fn batching_coalesces_deltas_up_to_limit() {
        let events = run_with(
            vec![
                NormalizedDelta::text("a"),
                NormalizedDelta::text("b"),
                NormalizedDelta::text("c"),
                NormalizedDelta::text("d"),
                NormalizedDelta::text("e"),
            ],
            NormalizerConfig { batch_size: 2 },
        );
        assert_eq!(
            events,
            vec![
                BlockEvent::TextStart,
                BlockEvent::TextDelta { text: "ab".into() },
                BlockEvent::TextDelta { text: "cd".into() },
                BlockEvent::TextDelta { text: "e".into() },
                BlockEvent::TextEnd,
            ]
        );
    }

    #[test]
    fn batching_flushes_on_other_tool_id() {
        let events = run_with(
            vec![
                NormalizedDelta::tool_start("a", "t"),
                NormalizedDelta::tool_start("b", "t"),
                NormalizedDelta::tool_args("a", "{"),
                NormalizedDelta::tool_args("b", "{"),
                NormalizedDelta::tool_args("a", "}"),
            ],
            NormalizerConfig { batch_size: 8 },
        );
        let deltas: Vec<_> = events.iter().filter(|e| e.is_delta()).collect();
        assert_eq!(deltas.len(), 3);
    }

    #[test]
    fn usage_is_aggregated_silently() {
        let mut n = BlockNormalizer::new(NormalizerConfig::default());
        let out = n.push(NormalizedDelta::Usage(TokenUsage {
            input_tokens: 10,
            ..Default::default()
        }));
        assert!(out.is_empty());
        n.push(NormalizedDelta::Usage(TokenUsage {
            output_tokens: 4,
            ..Default::default()
        }));
        assert_eq!(n.usage().total(), 14);
    }

    #[test]
    fn running_usage_totals_are_not_double_counted() {
        let mut decoder = SseDecoder::new("anthropic", "m");
        let mut n = BlockNormalizer::new(NormalizerConfig::default());
        let events = [
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":100,"output_tokens":1}}}"#,
            ),
            ("message_delta", r#"{"delta":{"stop_reason":null},"usage":{"output_tokens":20}}"#),
            ("message_delta", r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#),
        ];
        for (event, data) in events {
            for delta in decoder.decode(event, data) {
                n.push(delta.unwrap());
            }
        }
        assert_eq!(
            n.usage(),
            TokenUsage {
                input_tokens: 100,
                output_tokens: 42,
                ..Default::default()
            }
        );
    }

    #[test]
    fn code_block_carries_metadata_and_diff() {
        let events = run(vec![NormalizedDelta::Code {
            language: Some("py".into()),
            file_path: Some("a.py".into()),
            fragment: "x = 1".into(),
            diff: "+x = 1".into(),
        }]);
        assert_eq!(
            events,
            vec![
                BlockEvent::CodeStart {
                    language: Some("py".into()),
                    file_path: Some("a.py".into())
                },
                BlockEvent::CodeDelta {
                    code: "x = 1".into(),
                    diff: "+x = 1".into()
                },
                BlockEvent::CodeEnd,
            ]
        );
    }

    fn boxed(items: Vec<Result<NormalizedDelta, ProviderError>>) -> DeltaStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn stream_exposes_usage_after_exhaustion() {
        let inner = boxed(vec![
            Ok(NormalizedDelta::text("hi")),
            Ok(NormalizedDelta::Usage(TokenUsage {
                output_tokens: 3,
                ..Default::default()
            })),
        ]);
        let mut stream = NormalizedStream::new(inner, NormalizerConfig::default(), CancellationToken::new());
        let usage = stream.usage_handle();
        assert!(usage.get().is_none());

        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], BlockEvent::TextEnd);
        assert_eq!(usage.get().unwrap().output_tokens, 3);
    }

    #[tokio::test]
    async fn provider_error_ends_stream_without_synthetic_end() {
        let inner = boxed(vec![
            Ok(NormalizedDelta::text("par")),
            Err(ProviderError::Network("reset".into())),
            Ok(NormalizedDelta::text("never")),
        ]);
        let items: Vec<_> = NormalizedStream::new(
            inner,
            NormalizerConfig { batch_size: 4 },
            CancellationToken::new(),
        )
        .collect()
        .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok(BlockEvent::TextStart));
        assert_eq!(items[1], Ok(BlockEvent::TextDelta { text: "par".into() }));
        assert!(matches!(
            items[2],
            Err(NormalizeError::Provider(ProviderError::Network(_)))
        ));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_next_poll() {
        let cancel = CancellationToken::new();
        let inner = boxed(vec![Ok(NormalizedDelta::text("a")), Ok(NormalizedDelta::text("b"))]);
        let mut stream = NormalizedStream::new(inner, NormalizerConfig::default(), cancel.clone());

        assert_eq!(stream.next().await, Some(Ok(BlockEvent::TextStart)));
        cancel.cancel();
        assert_eq!(stream.next().await, Some(Err(NormalizeError::Cancelled)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn cancellation_wakes_a_stalled_stream() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        let inner: DeltaStream = Box::pin(futures::stream::pending());
        let mut stream = NormalizedStream::new(inner, NormalizerConfig::default(), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let item = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert_eq!(item, Some(Err(NormalizeError::Cancelled)));
    }
}
