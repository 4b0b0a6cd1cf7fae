use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::llm::{Message, ThinkingBlock};

/// The sole persisted/resumable artifact: the full conversation history.
/// Opaque to callers; round-trips through JSON for pause/resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentState {
    pub messages: Vec<Message>,
}

/// Result of executing one action.
///
/// `is_done = true` terminates the run loop; `give_control = true` signals a
/// handoff to a human without necessarily ending the task. At most one of
/// `content`/`error` is meaningfully set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionResult {
    #[serde(default)]
    pub is_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub give_control: bool,
}

impl ActionResult {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            error: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self {
            is_done: true,
            content: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Action chosen by the model: a registry name plus free-form parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionModel {
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Parsed structured output of one model turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLlmOutput {
    pub thought: String,
    pub action: ActionModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_block: Option<ThinkingBlock>,
}

/// Final output of a run: resumable state, the last action result, the step
/// tally, and the browser's persisted storage state (cookies etc.) as an
/// opaque JSON value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutput {
    pub agent_state: AgentState,
    pub result: ActionResult,
    #[serde(default)]
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Events yielded by the streaming run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamChunk {
    /// One completed step.
    Step(StepChunkContent),
    /// A step failed after exhausting its retries; the stream terminates with
    /// a final-output chunk right after.
    StepError { message: String },
    /// The per-step timeout elapsed; carries everything needed to resume.
    StepTimeout(TimeoutChunkContent),
    /// Terminal chunk: the run's final output.
    FinalOutput(AgentOutput),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepChunkContent {
    pub action_result: ActionResult,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutChunkContent {
    pub action_result: ActionResult,
    pub summary: String,
    /// Step number the caller should pass back as `prev_step` on resume.
    pub step: usize,
    pub agent_state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}
