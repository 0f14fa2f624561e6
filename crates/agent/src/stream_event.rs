//! Agent-level lifecycle events.
//!
//! `AgentStreamEvent` is the single ordered feed a presentation layer
//! subscribes to: block lifecycle from the stream decoder, tool dispatch and
//! results from the orchestrator, usage reports, and the final termination.

use revloop_core::provider::Usage;
use revloop_core::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};

use crate::loop_runner::Termination;

/// Kinds of streamed block that announce themselves before content arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
}

/// Events emitted by the agent while a `chat()` call runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// A text or thinking block opened.
    BlockStarted { kind: BlockKind },

    /// A tool-use block opened; its input has not arrived yet.
    ToolStarted { id: String, name: String },

    /// A thinking block closed.
    ThinkingCompleted { thinking: String, signature: String },

    /// A redacted thinking block arrived (always whole).
    RedactedThinking { data: String },

    /// A text block closed. Carries all text of the turn so far.
    TextCompleted { text: String },

    /// A tool-use block closed with its parsed input.
    ToolCompleted { call: ToolCall },

    /// Token usage for the turn.
    Usage { usage: Usage },

    /// The model turn is complete.
    Done,

    /// The orchestrator is about to handle a tool call.
    ToolDispatched { call: ToolCall },

    /// A tool result was produced (executed, refused or synthesized).
    ToolResult { result: ToolResult },

    /// The `chat()` call finished.
    Terminated {
        termination: Termination,
        iterations: u32,
    },
}

impl AgentStreamEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BlockStarted { .. } => "block_started",
            Self::ToolStarted { .. } => "tool_started",
            Self::ThinkingCompleted { .. } => "thinking_completed",
            Self::RedactedThinking { .. } => "redacted_thinking",
            Self::TextCompleted { .. } => "text_completed",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::Usage { .. } => "usage",
            Self::Done => "done",
            Self::ToolDispatched { .. } => "tool_dispatched",
            Self::ToolResult { .. } => "tool_result",
            Self::Terminated { .. } => "terminated",
        }
    }
}
