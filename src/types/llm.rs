use serde::{Deserialize, Serialize};

/// Conversational roles understood by every provider adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One block inside a message's ordered content sequence.
///
/// `cacheable` marks a block as *eligible* for the prompt-cache breakpoint;
/// `cache_control` is the live marker set by the outbound transform on at
/// most one block across the whole history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cacheable: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cache_control: bool,
    },
    Image {
        /// MIME type of the payload, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded image bytes.
        data: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cacheable: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cache_control: bool,
    },
    Thinking {
        text: String,
        /// Opaque provider signature required to replay the block.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: text.into(),
            cacheable: false,
            cache_control: false,
        }
    }

    pub fn image_png(data: impl Into<String>) -> Self {
        ContentBlock::Image {
            media_type: "image/png".to_string(),
            data: data.into(),
            cacheable: false,
            cache_control: false,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        match self {
            ContentBlock::Text { cacheable, .. } | ContentBlock::Image { cacheable, .. } => {
                *cacheable
            }
            ContentBlock::Thinking { .. } => false,
        }
    }

    pub fn mark_cacheable(mut self) -> Self {
        match &mut self {
            ContentBlock::Text { cacheable, .. } | ContentBlock::Image { cacheable, .. } => {
                *cacheable = true;
            }
            ContentBlock::Thinking { .. } => {}
        }
        self
    }

    pub fn has_cache_marker(&self) -> bool {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. } => *cache_control,
            ContentBlock::Thinking { .. } => false,
        }
    }

    pub(crate) fn set_cache_marker(&mut self, value: bool) {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. } => *cache_control = value,
            ContentBlock::Thinking { .. } => {}
        }
    }
}

/// One conversational turn in the agent's history.
///
/// State messages (`is_state_message`) encode a browser snapshot and carry a
/// precomputed `compact` alternative; the outbound transform substitutes the
/// compact form for every state message except the most recent one so that
/// image payload stays O(1) per step. The stored history itself is never
/// mutated retroactively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_state_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compact: Option<Vec<ContentBlock>>,
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            is_state_message: false,
            compact: None,
        }
    }

    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::text(text)])
    }

    /// Concatenated text of every text block, used by token estimation and
    /// provider adapters that flatten content.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token accounting reported by a provider for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Extended-reasoning block returned by providers that support it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThinkingBlock {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Provider-neutral completion result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingBlock>,
}
