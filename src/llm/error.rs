use thiserror::Error;

/// Errors surfaced by the LLM provider layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing model API key; set MODEL_API_KEY, ANTHROPIC_API_KEY, or OPENAI_API_KEY")]
    MissingApiKey,
    #[error("invalid completion request: {0}")]
    InvalidRequest(String),
    #[error("provider returned an empty completion")]
    EmptyResponse,
    /// Transient transport failure; retried with backoff before surfacing.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Api(String),
}

impl LlmError {
    /// Whether a bounded retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transport(_))
    }
}
