//! Language model provider abstractions.
//!
//! Houses the provider-agnostic call contract plus the two wire-shape
//! adapters: an OpenAI-compatible one backed by `async-openai` (flat message
//! array with inline image parts) and an Anthropic-shaped one backed by
//! `reqwest` (separated system field, tagged content blocks, cache markers).

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod provider;

use std::sync::Arc;

pub use anthropic::AnthropicProvider;
pub use error::LlmError;
pub use openai::OpenAiProvider;
pub use provider::LlmProvider;

use crate::config::{PilotConfig, ProviderKind};

/// Build the provider selected by the configuration.
pub fn provider_from_config(config: &PilotConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::from_config(config)?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::from_config(config)?)),
    }
}
