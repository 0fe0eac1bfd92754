use serde_json::{json, Value};

use blockrelay_core::chat::{Actor, ChatTurn, ToolStatus, TurnPayload};
use blockrelay_core::provider::ModelRequest;

const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// Build an Anthropic Messages API request body for `request`.
pub fn build_request_body(request: &ModelRequest, model: &str) -> Value {
    json!({
        "model": model,
        "stream": true,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": convert_turns(&request.history),
    })
}

/// Convert persisted turns into alternating user/assistant messages.
///
/// Tool results are sent as a user message right after the assistant message
/// that requested them. Thinking and system info turns are not replayed.
pub fn convert_turns(turns: &[ChatTurn]) -> Vec<Value> {
    let mut builder = MessageBuilder::default();
    for turn in turns {
        match (&turn.actor, &turn.payload) {
            (Actor::System, _) | (_, TurnPayload::Info { .. }) | (_, TurnPayload::Thinking { .. }) => {}
            (Actor::User, TurnPayload::Text { text }) => {
                builder.push("user", json!({"type": "text", "text": text}));
            }
            (_, TurnPayload::Text { text }) => {
                builder.push("assistant", json!({"type": "text", "text": text}));
            }
            (_, TurnPayload::Code {
                language,
                file_path,
                code,
                ..
            }) => {
                let header = match file_path {
                    Some(path) => format!("{path}\n"),
                    None => String::new(),
                };
                let fenced = format!(
                    "{header}```{}\n{code}\n```",
                    language.as_deref().unwrap_or("")
                );
                builder.push("assistant", json!({"type": "text", "text": fenced}));
            }
            (_, TurnPayload::ToolUse(tool)) => {
                builder.push(
                    "assistant",
                    json!({
                        "type": "tool_use",
                        "id": tool.tool_use_id,
                        "name": tool.tool_name,
                        "input": tool.tool_input,
                    }),
                );
                if let Some(response) = &tool.tool_response {
                    let content = match response {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    builder.results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tool.tool_use_id,
                        "content": content,
                        "is_error": tool.status != ToolStatus::Completed,
                    }));
                }
            }
        }
    }
    builder.finish()
}

#[derive(Default)]
struct MessageBuilder {
    messages: Vec<Value>,
    role: Option<&'static str>,
    blocks: Vec<Value>,
    results: Vec<Value>,
}

impl MessageBuilder {
    fn push(&mut self, role: &'static str, block: Value) {
        if self.role != Some(role) {
            self.flush();
            if self.role.is_some() && self.role != Some(role) {
                self.flush();
            }
            self.role = Some(role);
        }
        self.blocks.push(block);
    }

    fn flush(&mut self) {
        if let Some(role) = self.role.take() {
            if !self.blocks.is_empty() {
                self.messages.push(json!({
                    "role": role,
                    "content": std::mem::take(&mut self.blocks),
                }));
            }
        }
        if !self.results.is_empty() {
            // Results open a user message that following user text joins.
            self.role = Some("user");
            self.blocks = std::mem::take(&mut self.results);
        }
    }

    fn finish(mut self) -> Vec<Value> {
        self.flush();
        self.flush();
        self.messages
    }
}
