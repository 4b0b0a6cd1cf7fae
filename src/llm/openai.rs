use std::time::Duration;

use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use tokio::time::sleep;

use crate::config::PilotConfig;
use crate::types::{ContentBlock, LlmResponse, Message, MessageRole, TokenUsage};

use super::error::LlmError;
use super::provider::LlmProvider;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1_000;

/// Provider speaking the flat-message-array wire shape: every turn is one
/// entry with inline image parts; there is no separate system field and no
/// cache or thinking surface.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn from_config(config: &PilotConfig) -> Result<Self, LlmError> {
        let api_key = config
            .model_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or(LlmError::MissingApiKey)?;

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = &config.model_base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model_name.clone(),
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let request_messages = convert_messages(messages)?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(self.model.clone());
        builder.messages(request_messages);
        builder.max_completion_tokens(self.max_tokens);
        if let Some(temperature) = self.temperature {
            builder.temperature(temperature);
        }
        let request = builder
            .build()
            .map_err(|err| LlmError::InvalidRequest(err.to_string()))?;

        let mut delay = Duration::from_millis(BASE_BACKOFF_MS);
        let mut attempt = 1;
        let response = loop {
            match self.client.chat().create(request.clone()).await {
                Ok(response) => break response,
                Err(err) => {
                    let mapped = map_openai_error(err);
                    if mapped.is_retryable() && attempt < MAX_ATTEMPTS {
                        attempt += 1;
                        sleep(delay).await;
                        delay *= 2;
                    } else {
                        return Err(mapped);
                    }
                }
            }
        };

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        let usage = response
            .usage
            .map(|usage| TokenUsage {
                prompt_tokens: u64::from(usage.prompt_tokens),
                completion_tokens: u64::from(usage.completion_tokens),
                total_tokens: u64::from(usage.total_tokens),
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage,
            thinking: None,
        })
    }
}

fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(inner) => LlmError::Transport(inner.to_string()),
        other => LlmError::Api(other.to_string()),
    }
}

fn convert_messages(
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    let invalid = |err: OpenAIError| LlmError::InvalidRequest(err.to_string());
    let mut converted = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            MessageRole::System => {
                converted.push(ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(ChatCompletionRequestSystemMessageContent::Text(
                            message.joined_text(),
                        ))
                        .build()
                        .map_err(invalid)?,
                ));
            }
            MessageRole::Assistant => {
                // Thinking blocks are provider-specific; this shape only
                // carries the text output.
                converted.push(ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(ChatCompletionRequestAssistantMessageContent::Text(
                            message.joined_text(),
                        ))
                        .build()
                        .map_err(invalid)?,
                ));
            }
            MessageRole::User | MessageRole::Tool => {
                let has_images = message
                    .content
                    .iter()
                    .any(|block| matches!(block, ContentBlock::Image { .. }));

                let content = if has_images {
                    let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
                    for block in &message.content {
                        match block {
                            ContentBlock::Text { text, .. } => parts.push(
                                ChatCompletionRequestMessageContentPartTextArgs::default()
                                    .text(text.clone())
                                    .build()
                                    .map_err(invalid)?
                                    .into(),
                            ),
                            ContentBlock::Image {
                                media_type, data, ..
                            } => parts.push(
                                ChatCompletionRequestMessageContentPartImageArgs::default()
                                    .image_url(
                                        ImageUrlArgs::default()
                                            .url(format!("data:{media_type};base64,{data}"))
                                            .build()
                                            .map_err(invalid)?,
                                    )
                                    .build()
                                    .map_err(invalid)?
                                    .into(),
                            ),
                            ContentBlock::Thinking { .. } => {}
                        }
                    }
                    ChatCompletionRequestUserMessageContent::Array(parts)
                } else {
                    ChatCompletionRequestUserMessageContent::Text(message.joined_text())
                };

                converted.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content)
                        .build()
                        .map_err(invalid)?,
                ));
            }
        }
    }

    Ok(converted)
}
