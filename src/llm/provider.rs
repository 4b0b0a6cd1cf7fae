use async_trait::async_trait;

use crate::types::{LlmResponse, Message};

use super::error::LlmError;

/// Abstraction over LLM providers so the agent loop can be tested without
/// real HTTP requests: the full message history goes in, text (and optional
/// thinking) comes out.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn call(&self, messages: &[Message]) -> Result<LlmResponse, LlmError>;
}
