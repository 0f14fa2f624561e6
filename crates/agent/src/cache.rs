//! Prompt cache annotation.
//!
//! Marks the end of the system prompt, the last tool definition and the last
//! content block of the last message as cacheable. Everything before each
//! marker is a prefix the server can reuse on the next request, so the
//! marker count stays constant however long the conversation grows.

use revloop_core::message::{ContentBlock, Message, MessageContent};
use revloop_core::provider::{
    CacheControl, RequestBlock, RequestContent, RequestMessage, RequestTool, SystemPrompt,
    ToolDefinition,
};

/// Builds the wire form of a request, adding cache markers when enabled.
#[derive(Debug, Clone, Copy)]
pub struct CacheAnnotator {
    enabled: bool,
}

impl CacheAnnotator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// The system prompt. Promoted to a single marked block when enabled.
    pub fn system(&self, prompt: &str) -> Option<SystemPrompt> {
        if prompt.is_empty() {
            return None;
        }
        if !self.enabled {
            return Some(SystemPrompt::Text(prompt.to_string()));
        }
        Some(SystemPrompt::Blocks(vec![marked(RequestBlock::from(
            ContentBlock::text(prompt),
        ))]))
    }

    /// Tool definitions, with the last one marked.
    pub fn tools(&self, definitions: Vec<ToolDefinition>) -> Vec<RequestTool> {
        let count = definitions.len();
        definitions
            .into_iter()
            .enumerate()
            .map(|(i, definition)| RequestTool {
                definition,
                cache_control: (self.enabled && i + 1 == count).then(CacheControl::ephemeral),
            })
            .collect()
    }

    /// A copy of the history in wire form, with the last block of the last
    /// message marked. A plain-string last message becomes one text block.
    pub fn messages(&self, messages: &[Message]) -> Vec<RequestMessage> {
        let last = messages.len().saturating_sub(1);
        messages
            .iter()
            .enumerate()
            .map(|(i, message)| {
                let content = if self.enabled && i == last {
                    let mut blocks: Vec<RequestBlock> = message
                        .content
                        .to_blocks()
                        .into_iter()
                        .map(RequestBlock::from)
                        .collect();
                    if let Some(block) = blocks.pop() {
                        blocks.push(marked(block));
                    }
                    RequestContent::Blocks(blocks)
                } else {
                    match &message.content {
                        MessageContent::Text(text) => RequestContent::Text(text.clone()),
                        MessageContent::Blocks(blocks) => RequestContent::Blocks(
                            blocks.iter().cloned().map(RequestBlock::from).collect(),
                        ),
                    }
                };
                RequestMessage {
                    role: message.role,
                    content,
                }
            })
            .collect()
    }
}

fn marked(mut block: RequestBlock) -> RequestBlock {
    block.cache_control = Some(CacheControl::ephemeral());
    block
}
