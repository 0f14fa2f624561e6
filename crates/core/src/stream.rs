//! Low-level stream events.
//!
//! A streamed model turn is an ordered sequence of content block lifecycle
//! events (start, delta, stop) framed by message-level events. The variants
//! mirror the Messages API server-sent event payloads, so a transport can
//! deserialize each `data:` line straight into a [`StreamEvent`].

use serde::{Deserialize, Serialize};

use crate::message::ContentBlock;
use crate::provider::{Response, Usage};

/// One event of a streamed model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Usage,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
}

/// Payload of `message_start`. Only usage is of interest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub usage: Usage,
}

/// The kind of a block being opened, with whatever arrives up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    /// Delivered whole; no deltas follow.
    RedactedThinking {
        data: String,
    },
}

/// An incremental payload for the open block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    SignatureDelta {
        signature: String,
    },
    /// A fragment of the tool input JSON document.
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// Render a complete response as the event sequence a streaming transport
/// would have produced for it.
///
/// Lets non-streaming backends (and test doubles) drive the same decoding
/// path as a live stream.
pub fn replay(response: &Response) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        message: MessageStart {
            usage: Usage {
                output_tokens: 0,
                ..response.usage
            },
        },
    }];
    let mut index = 0;

    for block in &response.thinking_blocks {
        match block {
            ContentBlock::Thinking { thinking, signature } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: BlockStart::Thinking {
                        thinking: String::new(),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: thinking.clone(),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::SignatureDelta {
                        signature: signature.clone(),
                    },
                });
            }
            ContentBlock::RedactedThinking { data } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: BlockStart::RedactedThinking { data: data.clone() },
                });
            }
            _ => continue,
        }
        events.push(StreamEvent::ContentBlockStop { index });
        index += 1;
    }

    if !response.text.is_empty() {
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::Text { text: String::new() },
        });
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: response.text.clone(),
            },
        });
        events.push(StreamEvent::ContentBlockStop { index });
        index += 1;
    }

    for call in &response.tool_calls {
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
            },
        });
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: call.input.to_string(),
            },
        });
        events.push(StreamEvent::ContentBlockStop { index });
        index += 1;
    }

    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: Some(response.stop_reason.as_wire().to_string()),
        },
        usage: Usage {
            output_tokens: response.usage.output_tokens,
            ..Usage::default()
        },
    });
    events.push(StreamEvent::MessageStop);
    events
}
