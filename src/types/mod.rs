//! Core data structures shared across the agent.
//!
//! These strongly-typed models provide the vocabulary for browser snapshots,
//! LLM payloads, and agent execution results.

pub mod agent;
pub mod elements;
pub mod llm;

pub use agent::{
    ActionModel, ActionResult, AgentLlmOutput, AgentOutput, AgentState, AgentStreamChunk,
    StepChunkContent, TimeoutChunkContent,
};
pub use elements::{BrowserState, ElementRect, InteractiveElement, Point, TabInfo, Viewport};
pub use llm::{ContentBlock, LlmResponse, Message, MessageRole, ThinkingBlock, TokenUsage};
