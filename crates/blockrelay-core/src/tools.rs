use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::ToolStatus;
use crate::ids::{SessionId, ToolUseId};

/// A fully parsed tool call handed to an executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_use_id: ToolUseId,
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// An executor's answer, matched back to its call by `tool_use_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub tool_use_id: ToolUseId,
    pub status: ToolStatus,
    #[serde(default)]
    pub response: serde_json::Value,
}

/// In-process executor. Tools run by remote clients bypass this and submit
/// their responses through the coordinator directly.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn dispatch(&self, session_id: &SessionId, invocation: ToolInvocation) -> ToolResponse;
}
