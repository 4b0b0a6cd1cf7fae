use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::sleep;

use crate::config::PilotConfig;
use crate::types::{ContentBlock, LlmResponse, Message, MessageRole, ThinkingBlock, TokenUsage};

use super::error::LlmError;
use super::provider::LlmProvider;

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1_000;

/// Provider speaking the separated-system wire shape: system blocks go in a
/// dedicated top-level field, every other turn carries tagged content blocks,
/// and cache markers translate to ephemeral `cache_control` entries.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: u32,
    thinking_budget_tokens: Option<u32>,
}

impl AnthropicProvider {
    pub fn from_config(config: &PilotConfig) -> Result<Self, LlmError> {
        let api_key = config
            .model_api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or(LlmError::MissingApiKey)?;

        let endpoint = config
            .model_base_url
            .clone()
            .map(|base| format!("{}/v1/messages", base.trim_end_matches('/')))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint,
            model: config.model_name.clone(),
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            thinking_budget_tokens: config.thinking_budget_tokens,
        })
    }

    fn build_body(&self, messages: &[Message]) -> Value {
        let (system_blocks, turns) = split_messages(messages);

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": turns,
        });

        if !system_blocks.is_empty() {
            body["system"] = Value::Array(system_blocks);
        }

        if let Some(budget) = self.thinking_budget_tokens {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        } else if let Some(temperature) = self.temperature {
            // Extended thinking forbids a temperature override.
            body["temperature"] = json!(temperature);
        }

        body
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let body = self.build_body(messages);

        let mut delay = Duration::from_millis(BASE_BACKOFF_MS);
        let mut attempt = 1;
        let payload: Value = loop {
            match self.send_once(&body).await {
                Ok(payload) => break payload,
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        };

        parse_response(&payload)
    }
}

impl AnthropicProvider {
    async fn send_once(&self, body: &Value) -> Result<Value, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|err| LlmError::Api(format!("malformed response body: {err}")))
        } else if status.as_u16() == 429 || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            Err(LlmError::Transport(format!("{status}: {text}")))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(LlmError::Api(format!("{status}: {text}")))
        }
    }
}

/// Split history into top-level system blocks and alternating user/assistant
/// turns. Consecutive same-role turns are merged into one entry, which this
/// wire shape requires.
fn split_messages(messages: &[Message]) -> (Vec<Value>, Vec<Value>) {
    let mut system_blocks = Vec::new();
    let mut turns: Vec<Value> = Vec::new();

    for message in messages {
        if message.role == MessageRole::System {
            for block in &message.content {
                if let Some(rendered) = render_block(block) {
                    system_blocks.push(rendered);
                }
            }
            continue;
        }

        let role = match message.role {
            MessageRole::Assistant => "assistant",
            _ => "user",
        };
        let blocks: Vec<Value> = message.content.iter().filter_map(render_block).collect();
        if blocks.is_empty() {
            continue;
        }

        match turns.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["content"].as_array_mut() {
                    existing.extend(blocks);
                }
            }
            _ => turns.push(json!({ "role": role, "content": blocks })),
        }
    }

    (system_blocks, turns)
}

fn render_block(block: &ContentBlock) -> Option<Value> {
    let mut rendered = match block {
        ContentBlock::Text { text, .. } => json!({ "type": "text", "text": text }),
        ContentBlock::Image {
            media_type, data, ..
        } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        ContentBlock::Thinking { text, signature } => {
            let signature = signature.clone()?;
            json!({ "type": "thinking", "thinking": text, "signature": signature })
        }
    };

    if block.has_cache_marker() {
        rendered["cache_control"] = json!({ "type": "ephemeral" });
    }
    Some(rendered)
}

fn parse_response(payload: &Value) -> Result<LlmResponse, LlmError> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Api("response has no content array".into()))?;

    let mut content = String::new();
    let mut thinking = None;
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    content.push_str(text);
                }
            }
            Some("thinking") => {
                thinking = Some(ThinkingBlock {
                    text: block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    signature: block
                        .get("signature")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            _ => {}
        }
    }

    if content.is_empty() {
        return Err(LlmError::EmptyResponse);
    }

    let usage = payload.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(LlmResponse {
        content,
        usage: TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
        thinking,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_move_to_the_system_field() {
        let messages = vec![
            Message::new(
                MessageRole::System,
                vec![ContentBlock::text("be careful").mark_cacheable()],
            ),
            Message::text(MessageRole::User, "task"),
        ];

        let (system, turns) = split_messages(&messages);
        assert_eq!(system.len(), 1);
        assert_eq!(system[0]["text"], json!("be careful"));
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["role"], json!("user"));
    }

    #[test]
    fn cache_marker_renders_as_ephemeral_cache_control() {
        let mut block = ContentBlock::text("stable prefix").mark_cacheable();
        block.set_cache_marker(true);
        let rendered = render_block(&block).expect("rendered");
        assert_eq!(rendered["cache_control"], json!({ "type": "ephemeral" }));

        let unmarked = render_block(&ContentBlock::text("fresh")).expect("rendered");
        assert!(unmarked.get("cache_control").is_none());
    }

    #[test]
    fn consecutive_same_role_turns_are_merged() {
        let messages = vec![
            Message::text(MessageRole::User, "first"),
            Message::text(MessageRole::User, "second"),
            Message::text(MessageRole::Assistant, "reply"),
        ];
        let (_, turns) = split_messages(&messages);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn unsigned_thinking_blocks_are_not_replayed() {
        let block = ContentBlock::Thinking {
            text: "reasoning".into(),
            signature: None,
        };
        assert!(render_block(&block).is_none());
    }

    #[test]
    fn parses_text_and_thinking_blocks() {
        let payload = json!({
            "content": [
                { "type": "thinking", "thinking": "let me see", "signature": "sig-1" },
                { "type": "text", "text": "<output>{}</output>" }
            ],
            "usage": { "input_tokens": 120, "output_tokens": 30 }
        });

        let response = parse_response(&payload).expect("parse");
        assert_eq!(response.content, "<output>{}</output>");
        let thinking = response.thinking.expect("thinking");
        assert_eq!(thinking.text, "let me see");
        assert_eq!(thinking.signature.as_deref(), Some("sig-1"));
        assert_eq!(response.usage.total_tokens, 150);
    }

    #[test]
    fn empty_content_is_an_error() {
        let payload = json!({ "content": [], "usage": {} });
        assert!(matches!(
            parse_response(&payload),
            Err(LlmError::EmptyResponse)
        ));
    }

    #[test]
    fn thinking_budget_suppresses_temperature() {
        let mut config = PilotConfig::default();
        config.model_api_key = Some("key".into());
        config.thinking_budget_tokens = Some(2048);
        let provider = AnthropicProvider::from_config(&config).expect("provider");

        let body = provider.build_body(&[Message::text(MessageRole::User, "hi")]);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["thinking"]["budget_tokens"], json!(2048));
    }
}
