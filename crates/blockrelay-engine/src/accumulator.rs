use std::sync::Arc;

use tracing::{debug, warn};

use blockrelay_core::blocks::BlockEvent;
use blockrelay_core::chat::{Actor, NewTurn, ToolStatus, ToolUsePayload, TurnMetadata, TurnPayload};
use blockrelay_core::history::ChatHistoryStore;
use blockrelay_core::ids::{QueryId, SessionId, ToolUseId, TurnId};
use blockrelay_core::tools::ToolInvocation;

use crate::error::EngineError;

/// A turn written by the accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct Accumulated {
    pub turn_id: TurnId,
    pub payload: TurnPayload,
}

struct CodeBuffer {
    language: Option<String>,
    file_path: Option<String>,
    code: String,
    diff: String,
}

struct ToolBuffer {
    tool_use_id: ToolUseId,
    tool_name: String,
    args: String,
}

/// Builds one assistant turn per completed block.
///
/// Text and thinking buffers concatenate fragments, code concatenates code
/// and diff separately, and tool-use concatenates raw JSON argument
/// fragments which are parsed only at End.
pub struct ConversationAccumulator {
    history: Arc<dyn ChatHistoryStore>,
    session_id: SessionId,
    query_id: QueryId,
    model: String,
    text: Option<String>,
    thinking: Option<String>,
    code: Option<CodeBuffer>,
    tools: Vec<ToolBuffer>,
    invocations: Vec<ToolInvocation>,
}

impl ConversationAccumulator {
    pub fn new(
        history: Arc<dyn ChatHistoryStore>,
        session_id: SessionId,
        query_id: QueryId,
        model: impl Into<String>,
    ) -> Self {
        Self {
            history,
            session_id,
            query_id,
            model: model.into(),
            text: None,
            thinking: None,
            code: None,
            tools: Vec::new(),
            invocations: Vec::new(),
        }
    }

    /// Whether any tool-use block completed this round.
    pub fn tool_use_detected(&self) -> bool {
        !self.invocations.is_empty()
    }

    /// Parsed invocations in completion order.
    pub fn invocations(&self) -> &[ToolInvocation] {
        &self.invocations
    }

    pub fn has_open_block(&self) -> bool {
        self.text.is_some() || self.thinking.is_some() || self.code.is_some() || !self.tools.is_empty()
    }

    /// Feed one block event. Returns the turn written when the event closes
    /// a block.
    pub async fn accept(&mut self, event: &BlockEvent) -> Result<Option<Accumulated>, EngineError> {
        match event {
            BlockEvent::TextStart => {
                self.text = Some(String::new());
                Ok(None)
            }
            BlockEvent::TextDelta { text } => {
                match self.text.as_mut() {
                    Some(buf) => buf.push_str(text),
                    None => debug!("text delta without open block"),
                }
                Ok(None)
            }
            BlockEvent::TextEnd => match self.text.take() {
                Some(text) => self.persist(TurnPayload::Text { text }).await.map(Some),
                None => Ok(None),
            },

            BlockEvent::ThinkingStart => {
                self.thinking = Some(String::new());
                Ok(None)
            }
            BlockEvent::ThinkingDelta { thinking } => {
                match self.thinking.as_mut() {
                    Some(buf) => buf.push_str(thinking),
                    None => debug!("thinking delta without open block"),
                }
                Ok(None)
            }
            BlockEvent::ThinkingEnd => match self.thinking.take() {
                Some(thinking) => self.persist(TurnPayload::Thinking { thinking }).await.map(Some),
                None => Ok(None),
            },

            BlockEvent::CodeStart { language, file_path } => {
                self.code = Some(CodeBuffer {
                    language: language.clone(),
                    file_path: file_path.clone(),
                    code: String::new(),
                    diff: String::new(),
                });
                Ok(None)
            }
            BlockEvent::CodeDelta { code, diff } => {
                match self.code.as_mut() {
                    Some(buf) => {
                        buf.code.push_str(code);
                        buf.diff.push_str(diff);
                    }
                    None => debug!("code delta without open block"),
                }
                Ok(None)
            }
            BlockEvent::CodeEnd => match self.code.take() {
                Some(buf) => self
                    .persist(TurnPayload::Code {
                        language: buf.language,
                        file_path: buf.file_path,
                        code: buf.code,
                        diff: buf.diff,
                    })
                    .await
                    .map(Some),
                None => Ok(None),
            },

            BlockEvent::ToolUseStart { tool_use_id, tool_name } => {
                if self.tools.iter().any(|t| &t.tool_use_id == tool_use_id) {
                    warn!(tool_use_id = %tool_use_id, "tool block restarted, discarding earlier arguments");
                    self.tools.retain(|t| &t.tool_use_id != tool_use_id);
                }
                self.tools.push(ToolBuffer {
                    tool_use_id: tool_use_id.clone(),
                    tool_name: tool_name.clone(),
                    args: String::new(),
                });
                Ok(None)
            }
            BlockEvent::ToolUseDelta { tool_use_id, fragment } => {
                match self.tools.iter_mut().find(|t| &t.tool_use_id == tool_use_id) {
                    Some(buf) => buf.args.push_str(fragment),
                    None => debug!(tool_use_id = %tool_use_id, "tool delta without open block"),
                }
                Ok(None)
            }
            BlockEvent::ToolUseEnd { tool_use_id } => {
                let Some(pos) = self.tools.iter().position(|t| &t.tool_use_id == tool_use_id) else {
                    return Ok(None);
                };
                let buf = self.tools.remove(pos);
                self.finish_tool(buf).await.map(Some)
            }
        }
    }

    /// Persist whatever partial text, thinking or code is still open.
    /// Unfinished tool blocks are dropped since their arguments cannot be
    /// trusted.
    pub async fn force_close(&mut self) -> Result<Vec<Accumulated>, EngineError> {
        let mut written = Vec::new();
        if let Some(text) = self.text.take().filter(|t| !t.is_empty()) {
            written.push(self.persist(TurnPayload::Text { text }).await?);
        }
        if let Some(thinking) = self.thinking.take().filter(|t| !t.is_empty()) {
            written.push(self.persist(TurnPayload::Thinking { thinking }).await?);
        }
        if let Some(buf) = self.code.take().filter(|c| !c.code.is_empty() || !c.diff.is_empty()) {
            written.push(
                self.persist(TurnPayload::Code {
                    language: buf.language,
                    file_path: buf.file_path,
                    code: buf.code,
                    diff: buf.diff,
                })
                .await?,
            );
        }
        for tool in self.tools.drain(..) {
            warn!(tool_use_id = %tool.tool_use_id, tool_name = %tool.tool_name, "discarding unfinished tool block");
        }
        Ok(written)
    }

    async fn finish_tool(&mut self, buf: ToolBuffer) -> Result<Accumulated, EngineError> {
        let input = parse_tool_input(&buf.args).map_err(|e| EngineError::MalformedToolArguments {
            tool_use_id: buf.tool_use_id.clone(),
            tool_name: buf.tool_name.clone(),
            detail: e.to_string(),
        })?;
        let written = self
            .persist(TurnPayload::ToolUse(ToolUsePayload {
                tool_use_id: buf.tool_use_id.clone(),
                tool_name: buf.tool_name.clone(),
                tool_input: input.clone(),
                tool_response: None,
                status: ToolStatus::Pending,
            }))
            .await?;
        self.invocations.push(ToolInvocation {
            tool_use_id: buf.tool_use_id,
            tool_name: buf.tool_name,
            input,
        });
        Ok(written)
    }

    async fn persist(&self, payload: TurnPayload) -> Result<Accumulated, EngineError> {
        let turn_id = self
            .history
            .create_turn(NewTurn {
                session_id: self.session_id.clone(),
                query_id: self.query_id.clone(),
                actor: Actor::Assistant,
                payload: payload.clone(),
                metadata: TurnMetadata {
                    llm_model: Some(self.model.clone()),
                },
            })
            .await?;
        Ok(Accumulated { turn_id, payload })
    }
}

/// Tools called without arguments stream no fragments at all.
fn parse_tool_input(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}
