use serde::{Deserialize, Serialize};

use crate::blocks::BlockEvent;
use crate::ids::{QueryId, SessionId, ToolUseId};

/// Machine-readable classification carried by `STREAM_ERROR`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    LlmThrottled,
    InputTokenLimitExceeded,
    Cancelled,
    MalformedToolArguments,
    StreamExpired,
    LlmError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorContent {
    pub status: ErrorStatus,
    pub message: String,
    /// Status-specific fields, e.g. `retry_after` or `better_models`.
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl StreamErrorContent {
    pub fn new(status: ErrorStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.details.insert(key.to_string(), v);
            }
            Err(_) => {
                self.details.insert(key.to_string(), serde_json::Value::Null);
            }
        }
        self
    }
}

/// Client-facing record, serialized as `{"type": ..., "content": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireRecord {
    ResponseMetadata {
        query_id: QueryId,
        session_id: SessionId,
    },

    TextBlockStart {},
    TextBlockDelta {
        text: String,
    },
    TextBlockEnd {},

    ThinkingBlockStart {},
    ThinkingBlockDelta {
        thinking_delta: String,
    },
    ThinkingBlockEnd {},

    CodeBlockStart {
        language: Option<String>,
        filepath: Option<String>,
    },
    CodeBlockDelta {
        code_delta: String,
        diff_delta: String,
    },
    CodeBlockEnd {},

    ToolUseRequestStart {
        tool_use_id: ToolUseId,
        tool_name: String,
    },
    ToolUseRequestDelta {
        tool_use_id: ToolUseId,
        input_params_json_delta: String,
    },
    ToolUseRequestEnd {
        tool_use_id: ToolUseId,
    },

    SessionSummary {
        summary: String,
    },
    QueryComplete {
        query_id: QueryId,
        success: bool,
        summary: Option<String>,
    },
    StreamEnd {},
    StreamEndCloseConnection {},
    StreamError(StreamErrorContent),
}

impl WireRecord {
    /// Records after which the producer writes nothing more for this round.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StreamEnd {} | Self::StreamEndCloseConnection {} | Self::StreamError(_)
        )
    }

    /// Terminal records after which no further round will follow on the stream.
    pub fn closes_stream(&self) -> bool {
        matches!(self, Self::StreamEndCloseConnection {} | Self::StreamError(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ResponseMetadata { .. } => "RESPONSE_METADATA",
            Self::TextBlockStart {} => "TEXT_BLOCK_START",
            Self::TextBlockDelta { .. } => "TEXT_BLOCK_DELTA",
            Self::TextBlockEnd {} => "TEXT_BLOCK_END",
            Self::ThinkingBlockStart {} => "THINKING_BLOCK_START",
            Self::ThinkingBlockDelta { .. } => "THINKING_BLOCK_DELTA",
            Self::ThinkingBlockEnd {} => "THINKING_BLOCK_END",
            Self::CodeBlockStart { .. } => "CODE_BLOCK_START",
            Self::CodeBlockDelta { .. } => "CODE_BLOCK_DELTA",
            Self::CodeBlockEnd {} => "CODE_BLOCK_END",
            Self::ToolUseRequestStart { .. } => "TOOL_USE_REQUEST_START",
            Self::ToolUseRequestDelta { .. } => "TOOL_USE_REQUEST_DELTA",
            Self::ToolUseRequestEnd { .. } => "TOOL_USE_REQUEST_END",
            Self::SessionSummary { .. } => "SESSION_SUMMARY",
            Self::QueryComplete { .. } => "QUERY_COMPLETE",
            Self::StreamEnd {} => "STREAM_END",
            Self::StreamEndCloseConnection {} => "STREAM_END_CLOSE_CONNECTION",
            Self::StreamError(_) => "STREAM_ERROR",
        }
    }
}

impl From<BlockEvent> for WireRecord {
    fn from(event: BlockEvent) -> Self {
        match event {
            BlockEvent::TextStart => Self::TextBlockStart {},
            BlockEvent::TextDelta { text } => Self::TextBlockDelta { text },
            BlockEvent::TextEnd => Self::TextBlockEnd {},
            BlockEvent::ThinkingStart => Self::ThinkingBlockStart {},
            BlockEvent::ThinkingDelta { thinking } => Self::ThinkingBlockDelta {
                thinking_delta: thinking,
            },
            BlockEvent::ThinkingEnd => Self::ThinkingBlockEnd {},
            BlockEvent::CodeStart { language, file_path } => Self::CodeBlockStart {
                language,
                filepath: file_path,
            },
            BlockEvent::CodeDelta { code, diff } => Self::CodeBlockDelta {
                code_delta: code,
                diff_delta: diff,
            },
            BlockEvent::CodeEnd => Self::CodeBlockEnd {},
            BlockEvent::ToolUseStart { tool_use_id, tool_name } => {
                Self::ToolUseRequestStart { tool_use_id, tool_name }
            }
            BlockEvent::ToolUseDelta { tool_use_id, fragment } => Self::ToolUseRequestDelta {
                tool_use_id,
                input_params_json_delta: fragment,
            },
            BlockEvent::ToolUseEnd { tool_use_id } => Self::ToolUseRequestEnd { tool_use_id },
        }
    }
}
