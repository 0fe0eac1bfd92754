use serde::{Deserialize, Serialize};

use crate::ids::ToolUseId;
use crate::usage::TokenUsage;

/// Why the provider stopped generating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl FinishReason {
    /// Map a provider's raw stop reason onto the canonical set.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "end_turn" | "stop" => Self::EndTurn,
            "tool_use" | "tool_calls" => Self::ToolUse,
            "max_tokens" | "length" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A provider chunk decoded once at the provider boundary.
///
/// Everything downstream of the provider works only with this type, so the
/// normalizer never branches on vendor-specific shapes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedDelta {
    Text {
        fragment: String,
    },
    Thinking {
        fragment: String,
    },
    /// Code content. `language` and `file_path` are read when the fragment
    /// opens a new code block; a change in `file_path` starts a new block.
    Code {
        language: Option<String>,
        file_path: Option<String>,
        fragment: String,
        #[serde(default)]
        diff: String,
    },
    ToolStart {
        tool_use_id: ToolUseId,
        tool_name: String,
    },
    /// Raw JSON argument fragment. Without an id the fragment belongs to the
    /// most recently started tool call.
    ToolArgs {
        tool_use_id: Option<ToolUseId>,
        fragment: String,
    },
    ToolEnd {
        tool_use_id: Option<ToolUseId>,
    },
    Usage(TokenUsage),
    Finish(FinishReason),
}

impl NormalizedDelta {
    pub fn text(fragment: impl Into<String>) -> Self {
        Self::Text {
            fragment: fragment.into(),
        }
    }

    pub fn thinking(fragment: impl Into<String>) -> Self {
        Self::Thinking {
            fragment: fragment.into(),
        }
    }

    pub fn tool_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ToolStart {
            tool_use_id: ToolUseId::from_raw(id),
            tool_name: name.into(),
        }
    }

    pub fn tool_args(id: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::ToolArgs {
            tool_use_id: Some(ToolUseId::from_raw(id)),
            fragment: fragment.into(),
        }
    }

    pub fn tool_end(id: impl Into<String>) -> Self {
        Self::ToolEnd {
            tool_use_id: Some(ToolUseId::from_raw(id)),
        }
    }
}
