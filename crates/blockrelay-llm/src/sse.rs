use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use blockrelay_core::delta::{FinishReason, NormalizedDelta};
use blockrelay_core::errors::ProviderError;
use blockrelay_core::ids::ToolUseId;
use blockrelay_core::usage::TokenUsage;

/// Decodes Anthropic Messages API stream events into `NormalizedDelta`s.
///
/// Only tool-use blocks get explicit stop deltas; text and thinking
/// boundaries are inferred downstream from changes of content kind.
pub struct SseDecoder {
    provider: String,
    model: String,
    tool_blocks: HashMap<usize, ToolUseId>,
}

impl SseDecoder {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            tool_blocks: HashMap::new(),
        }
    }

    /// Decode one SSE event into zero or more deltas.
    pub fn decode(&mut self, event_type: &str, data: &str) -> Vec<Result<NormalizedDelta, ProviderError>> {
        let mut out = Vec::new();

        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStartEvent>(data) {
                    if let Some(usage) = msg.message.usage {
                        out.push(Ok(NormalizedDelta::Usage(usage.into_usage())));
                    }
                }
            }

            "content_block_start" => {
                if let Ok(block) = serde_json::from_str::<ContentBlockStartEvent>(data) {
                    match block.content_block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            let text = str_field(&block.content_block, "text");
                            if !text.is_empty() {
                                out.push(Ok(NormalizedDelta::text(text)));
                            }
                        }
                        Some("thinking") => {
                            let thinking = str_field(&block.content_block, "thinking");
                            if !thinking.is_empty() {
                                out.push(Ok(NormalizedDelta::thinking(thinking)));
                            }
                        }
                        Some("tool_use") => {
                            let id = ToolUseId::from_raw(str_field(&block.content_block, "id"));
                            let name = str_field(&block.content_block, "name").to_string();
                            self.tool_blocks.insert(block.index, id.clone());
                            out.push(Ok(NormalizedDelta::ToolStart {
                                tool_use_id: id,
                                tool_name: name,
                            }));
                        }
                        _ => {}
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(data) {
                    match delta.delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            out.push(Ok(NormalizedDelta::text(str_field(&delta.delta, "text"))));
                        }
                        Some("thinking_delta") => {
                            out.push(Ok(NormalizedDelta::thinking(str_field(&delta.delta, "thinking"))));
                        }
                        Some("input_json_delta") => {
                            out.push(Ok(NormalizedDelta::ToolArgs {
                                tool_use_id: self.tool_blocks.get(&delta.index).cloned(),
                                fragment: str_field(&delta.delta, "partial_json").to_string(),
                            }));
                        }
                        _ => {} // signature_delta etc.
                    }
                }
            }

            "content_block_stop" => {
                if let Ok(stop) = serde_json::from_str::<ContentBlockStopEvent>(data) {
                    if let Some(id) = self.tool_blocks.remove(&stop.index) {
                        out.push(Ok(NormalizedDelta::ToolEnd { tool_use_id: Some(id) }));
                    }
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    if let Some(usage) = delta.usage {
                        out.push(Ok(NormalizedDelta::Usage(usage.into_usage())));
                    }
                    if let Some(reason) = delta.delta.and_then(|d| d.stop_reason) {
                        out.push(Ok(NormalizedDelta::Finish(FinishReason::from_provider(&reason))));
                    }
                }
            }

            "error" => {
                if let Ok(err) = serde_json::from_str::<ErrorEvent>(data) {
                    out.push(Err(self.classify_error(&err)));
                } else {
                    out.push(Err(ProviderError::StreamInterrupted(data.to_string())));
                }
            }

            _ => {} // ping, message_stop
        }

        out
    }

    fn classify_error(&self, err: &ErrorEvent) -> ProviderError {
        let message = err.error.message.clone();
        match err.error.error_type.as_str() {
            "rate_limit_error" => ProviderError::Throttled {
                provider: self.provider.clone(),
                model: self.model.clone(),
                retry_after: None,
                detail: message,
                region: None,
            },
            "overloaded_error" => ProviderError::Server { status: 529, message },
            "authentication_error" | "permission_error" => ProviderError::Auth(message),
            "invalid_request_error" => {
                ProviderError::from_status(&self.provider, &self.model, 400, message, None)
            }
            _ => ProviderError::Server { status: 500, message },
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Parse raw SSE text into (event_type, data) pairs. Multi-line data is
/// joined with newlines.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            current_data.push(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((std::mem::take(&mut current_event), current_data.join("\n")));
            current_data.clear();
        }
    }

    if !current_event.is_empty() {
        events.push((current_event, current_data.join("\n")));
    }

    events
}

// --- Deserialization types for Anthropic SSE events ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

impl UsagePayload {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_read_tokens: self.cache_read_input_tokens.unwrap_or(0),
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: Value,
}

#[derive(Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
