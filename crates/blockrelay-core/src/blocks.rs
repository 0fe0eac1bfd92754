use serde::{Deserialize, Serialize};

use crate::ids::ToolUseId;

/// Content kind of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
    Code,
    ToolUse,
}

/// Canonical block-scoped event. Ordering contract per block:
///
/// Start → Delta* → End
///
/// Text, thinking and code blocks never overlap. Tool-use blocks may
/// interleave with each other (distinguished by `tool_use_id`) but never with
/// an open text, thinking or code block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BlockEvent {
    TextStart,
    TextDelta {
        text: String,
    },
    TextEnd,

    ThinkingStart,
    ThinkingDelta {
        thinking: String,
    },
    ThinkingEnd,

    CodeStart {
        language: Option<String>,
        file_path: Option<String>,
    },
    CodeDelta {
        code: String,
        diff: String,
    },
    CodeEnd,

    ToolUseStart {
        tool_use_id: ToolUseId,
        tool_name: String,
    },
    ToolUseDelta {
        tool_use_id: ToolUseId,
        fragment: String,
    },
    ToolUseEnd {
        tool_use_id: ToolUseId,
    },
}

impl BlockEvent {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::TextStart | Self::TextDelta { .. } | Self::TextEnd => BlockKind::Text,
            Self::ThinkingStart | Self::ThinkingDelta { .. } | Self::ThinkingEnd => BlockKind::Thinking,
            Self::CodeStart { .. } | Self::CodeDelta { .. } | Self::CodeEnd => BlockKind::Code,
            Self::ToolUseStart { .. } | Self::ToolUseDelta { .. } | Self::ToolUseEnd { .. } => {
                BlockKind::ToolUse
            }
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(
            self,
            Self::TextStart | Self::ThinkingStart | Self::CodeStart { .. } | Self::ToolUseStart { .. }
        )
    }

    pub fn is_end(&self) -> bool {
        matches!(
            self,
            Self::TextEnd | Self::ThinkingEnd | Self::CodeEnd | Self::ToolUseEnd { .. }
        )
    }

    pub fn is_delta(&self) -> bool {
        !self.is_start() && !self.is_end()
    }

    /// Append `next` onto this delta when both belong to the same block.
    /// Returns `next` back unchanged when they cannot be coalesced.
    pub fn coalesce(&mut self, next: BlockEvent) -> Result<(), BlockEvent> {
        match (self, next) {
            (Self::TextDelta { text }, Self::TextDelta { text: more }) => {
                text.push_str(&more);
                Ok(())
            }
            (Self::ThinkingDelta { thinking }, Self::ThinkingDelta { thinking: more }) => {
                thinking.push_str(&more);
                Ok(())
            }
            (Self::CodeDelta { code, diff }, Self::CodeDelta { code: c, diff: d }) => {
                code.push_str(&c);
                diff.push_str(&d);
                Ok(())
            }
            (
                Self::ToolUseDelta { tool_use_id, fragment },
                Self::ToolUseDelta {
                    tool_use_id: other_id,
                    fragment: more,
                },
            ) if *tool_use_id == other_id => {
                fragment.push_str(&more);
                Ok(())
            }
            (_, next) => Err(next),
        }
    }
}
