use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{QueryId, SessionId, ToolUseId, TurnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Assistant,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Text,
    Thinking,
    Code,
    ToolUse,
    Info,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::Code => "code",
            Self::ToolUse => "tool_use",
            Self::Info => "info",
        }
    }
}

/// Lifecycle of an external tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Completed,
    Failed,
    Aborted,
}

impl ToolStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolUsePayload {
    pub tool_use_id: ToolUseId,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    /// `None` marks a suspended invocation still waiting on its executor.
    pub tool_response: Option<serde_json::Value>,
    pub status: ToolStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnPayload {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    Code {
        language: Option<String>,
        file_path: Option<String>,
        code: String,
        diff: String,
    },
    ToolUse(ToolUsePayload),
    Info {
        info: String,
    },
}

impl TurnPayload {
    pub fn kind(&self) -> TurnKind {
        match self {
            Self::Text { .. } => TurnKind::Text,
            Self::Thinking { .. } => TurnKind::Thinking,
            Self::Code { .. } => TurnKind::Code,
            Self::ToolUse(_) => TurnKind::ToolUse,
            Self::Info { .. } => TurnKind::Info,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUsePayload> {
        match self {
            Self::ToolUse(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

/// A turn about to be written to the history store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTurn {
    pub session_id: SessionId,
    pub query_id: QueryId,
    pub actor: Actor,
    pub payload: TurnPayload,
    pub metadata: TurnMetadata,
}

/// One persisted, actor-attributed conversation unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: TurnId,
    pub session_id: SessionId,
    pub query_id: QueryId,
    pub actor: Actor,
    pub payload: TurnPayload,
    #[serde(default)]
    pub metadata: TurnMetadata,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn from_new(id: TurnId, turn: NewTurn, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            session_id: turn.session_id,
            query_id: turn.query_id,
            actor: turn.actor,
            payload: turn.payload,
            metadata: turn.metadata,
            created_at,
        }
    }

    pub fn kind(&self) -> TurnKind {
        self.payload.kind()
    }
}
