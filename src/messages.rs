//! Conversation history management.
//!
//! Builds the exact message sequence sent to the model and keeps its size
//! bounded. The canonical history preserves full fidelity; the outbound view
//! produced by [`MessageManager::sendable_messages`] substitutes each older
//! state message with its compact form (previous-action outcome plus one
//! scaled-down screenshot) so image payload stays O(1) per step, and enforces
//! the prompt-cache single-marker invariant.

use crate::highlight;
use crate::prompts;
use crate::types::{
    ActionResult, AgentLlmOutput, BrowserState, ContentBlock, Message, MessageRole,
};

/// Flat token cost assumed per image block by the estimator.
const IMAGE_TOKEN_ESTIMATE: usize = 1_100;

/// A few-shot demonstration pair: caption plus an optional screenshot.
#[derive(Debug, Clone)]
pub struct DemoImage {
    pub caption: String,
    pub image_b64: Option<String>,
}

/// Owns the conversation history for one agent run.
#[derive(Debug, Default)]
pub struct MessageManager {
    messages: Vec<Message>,
    token_budget: usize,
}

impl MessageManager {
    pub fn new(token_budget: usize) -> Self {
        Self {
            messages: Vec::new(),
            token_budget,
        }
    }

    /// Bootstrap a fresh session: system message with the action catalog and
    /// behavioral instructions, then the task plus few-shot demonstrations.
    /// The demonstration payload is pushed once and is cache-eligible.
    pub fn init_session(&mut self, task: &str, action_descriptions: &str, demos: &[DemoImage]) {
        self.messages.clear();

        let system = Message::new(
            MessageRole::System,
            vec![ContentBlock::text(prompts::system_message(action_descriptions)).mark_cacheable()],
        );
        self.messages.push(system);

        let mut blocks = vec![ContentBlock::text(prompts::task_message(task))];
        for demo in demos {
            blocks.push(ContentBlock::text(demo.caption.clone()));
            if let Some(image) = &demo.image_b64 {
                blocks.push(ContentBlock::image_png(image.clone()));
            }
        }
        if let Some(last) = blocks.pop() {
            blocks.push(last.mark_cacheable());
        }
        self.messages.push(Message::new(MessageRole::User, blocks));
    }

    /// Append the per-step state message: outcome of the previous action,
    /// the textual element listing, and the raw + highlighted screenshots.
    /// The compact alternative used once this step is no longer current is
    /// precomputed here, while the screenshot is at hand.
    pub fn add_state_message(
        &mut self,
        state: &BrowserState,
        previous_result: Option<&ActionResult>,
    ) {
        let state_text = build_state_text(state, previous_result);
        let outcome_text = build_outcome_text(previous_result);

        let content = vec![
            ContentBlock::text(state_text),
            ContentBlock::image_png(state.screenshot.clone()),
            ContentBlock::image_png(state.screenshot_with_highlights.clone()).mark_cacheable(),
        ];

        let mut compact = vec![ContentBlock::text(outcome_text)];
        if let Ok(scaled) = highlight::scale_screenshot(&state.screenshot) {
            compact.push(ContentBlock::image_png(scaled).mark_cacheable());
        }

        let mut message = Message::new(MessageRole::User, content);
        message.is_state_message = true;
        message.compact = Some(compact);
        self.messages.push(message);
    }

    /// Roll back the most recent state message, so a retried step starts
    /// from a clean slate instead of duplicating state entries. No-op when
    /// the last message is not a state message.
    pub fn remove_last_state_message(&mut self) {
        if self
            .messages
            .last()
            .map(|message| message.is_state_message)
            .unwrap_or(false)
        {
            self.messages.pop();
        }
    }

    /// Append the assistant turn: the provider's thinking block (if any)
    /// followed by the structured output serialized in its tagged envelope.
    pub fn add_assistant_message(&mut self, output: &AgentLlmOutput) {
        let mut blocks = Vec::new();
        if let Some(thinking) = &output.thinking_block {
            blocks.push(ContentBlock::Thinking {
                text: thinking.text.clone(),
                signature: thinking.signature.clone(),
            });
        }

        let payload = serde_json::json!({
            "thought": output.thought,
            "action": output.action,
            "summary": output.summary,
        });
        blocks.push(ContentBlock::text(format!("<output>{payload}</output>")));

        self.messages.push(Message::new(MessageRole::Assistant, blocks));
    }

    /// Derive the outbound message list.
    ///
    /// Every state message except the chronologically last is replaced by its
    /// compact form; the cache marker is then set on the last cache-eligible
    /// block and cleared everywhere else, so at most one marker survives.
    pub fn sendable_messages(&self) -> Vec<Message> {
        let last_state_index = self
            .messages
            .iter()
            .rposition(|message| message.is_state_message);

        let mut outbound: Vec<Message> = self
            .messages
            .iter()
            .enumerate()
            .map(|(index, message)| {
                let mut message = message.clone();
                if message.is_state_message && Some(index) != last_state_index {
                    if let Some(compact) = message.compact.take() {
                        message.content = compact;
                    }
                }
                message.compact = None;
                message
            })
            .collect();

        let mut marker_target: Option<(usize, usize)> = None;
        for (message_index, message) in outbound.iter().enumerate() {
            for (block_index, block) in message.content.iter().enumerate() {
                if block.is_cacheable() {
                    marker_target = Some((message_index, block_index));
                }
            }
        }

        for (message_index, message) in outbound.iter_mut().enumerate() {
            for (block_index, block) in message.content.iter_mut().enumerate() {
                block.set_cache_marker(Some((message_index, block_index)) == marker_target);
            }
        }

        outbound
    }

    /// Approximate token footprint of the outbound view: text at four
    /// characters per token plus a flat per-image cost.
    pub fn estimated_tokens(&self) -> usize {
        self.sendable_messages()
            .iter()
            .flat_map(|message| message.content.iter())
            .map(|block| match block {
                ContentBlock::Text { text, .. } | ContentBlock::Thinking { text, .. } => {
                    text.len() / 4
                }
                ContentBlock::Image { .. } => IMAGE_TOKEN_ESTIMATE,
            })
            .sum()
    }

    pub fn is_over_budget(&self) -> bool {
        self.token_budget > 0 && self.estimated_tokens() > self.token_budget
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replace the history wholesale, used to resume from serialized state.
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }
}

fn build_outcome_text(previous_result: Option<&ActionResult>) -> String {
    match previous_result {
        Some(result) => {
            if let Some(error) = &result.error {
                format!("<action_error>{error}</action_error>")
            } else {
                format!(
                    "<action_output>{}</action_output>",
                    result.content.as_deref().unwrap_or("action completed")
                )
            }
        }
        None => "<action_output>no previous action</action_output>".to_string(),
    }
}

fn build_state_text(state: &BrowserState, previous_result: Option<&ActionResult>) -> String {
    let mut sections = vec![build_outcome_text(previous_result)];

    sections.push(format!("Current URL: {}", state.url));

    if !state.tabs.is_empty() {
        let tabs = state
            .tabs
            .iter()
            .map(|tab| format!("[{}] {} ({})", tab.id, tab.title, tab.url))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Open tabs:\n{tabs}"));
    }

    let mut elements: Vec<_> = state
        .interactive_elements
        .values()
        .filter(|element| !element.is_grid_helper())
        .collect();
    elements.sort_by_key(|element| element.index);

    let listing = elements
        .iter()
        .map(|element| {
            let attrs = element
                .attributes
                .iter()
                .map(|(key, value)| format!(" {key}=\"{value}\""))
                .collect::<String>();
            format!(
                "[{}]<{}{}>{}</{}>",
                element.index, element.tag_name, attrs, element.text, element.tag_name
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    sections.push(format!("Interactive elements in the viewport:\n{listing}"));

    let above = state.viewport.scroll_distance_above_viewport;
    let below = state.viewport.scroll_distance_below_viewport;
    sections.push(if above > 0.0 {
        format!("{above:.0} pixels of content above the viewport - scroll up to reveal them.")
    } else {
        "You are at the start of the page.".to_string()
    });
    sections.push(if below > 0.0 {
        format!("{below:.0} pixels of content below the viewport - scroll down to reveal them.")
    } else {
        "You have reached the end of the page.".to_string()
    });

    sections.join("\n\n")
}
