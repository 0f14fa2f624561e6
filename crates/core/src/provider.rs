//! Provider trait: the abstraction over the model transport.
//!
//! A Provider knows how to send an (already cache-annotated) request to the
//! model and get a response back, either as one structured value or as an
//! ordered stream of [`StreamEvent`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::{ContentBlock, Role};
use crate::stream::{replay, StreamEvent};
use crate::tool::ToolCall;

/// A tool definition sent to the LLM so it knows what tools it can call.
///
/// The schema is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's input
    pub input_schema: serde_json::Value,
}

/// Server-side prompt cache directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    /// Cache type (always `"ephemeral"`).
    #[serde(rename = "type")]
    pub cache_type: String,
}

impl CacheControl {
    /// The short-lived (five minute) cache window.
    pub fn ephemeral() -> Self {
        Self {
            cache_type: "ephemeral".into(),
        }
    }
}

/// A content block as sent on the wire, optionally carrying a cache marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestBlock {
    #[serde(flatten)]
    pub block: ContentBlock,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl From<ContentBlock> for RequestBlock {
    fn from(block: ContentBlock) -> Self {
        Self {
            block,
            cache_control: None,
        }
    }
}

/// Wire message content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestContent {
    Text(String),
    Blocks(Vec<RequestBlock>),
}

/// A message as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: RequestContent,
}

/// The system prompt: a plain string, or structured blocks when caching.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<RequestBlock>),
}

/// A tool definition as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestTool {
    #[serde(flatten)]
    pub definition: ToolDefinition,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// Extended thinking settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
}

/// One request to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "claude-sonnet-4-20250514")
    pub model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// The conversation messages
    pub messages: Vec<RequestMessage>,

    /// Available tools the model can call
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<RequestTool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,

    /// Whether the transport should stream the response
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,

    /// Additional HTTP headers (e.g. beta feature flags)
    #[serde(skip)]
    pub extra_headers: Vec<(String, String)>,
}

/// Token usage for one model turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,

    #[serde(default)]
    pub output_tokens: u32,

    /// Tokens written to the prompt cache
    #[serde(default, rename = "cache_creation_input_tokens")]
    pub cache_write_tokens: u32,

    /// Tokens served from the prompt cache
    #[serde(default, rename = "cache_read_input_tokens")]
    pub cache_read_tokens: u32,
}

impl Usage {
    /// Fold a later usage report into this one.
    ///
    /// Counters reported as zero are treated as "not reported" and keep the
    /// earlier value; the transport sends input counts at message start and
    /// output counts at message end.
    pub fn merge(&mut self, later: &Usage) {
        if later.input_tokens > 0 {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens > 0 {
            self.output_tokens = later.output_tokens;
        }
        if later.cache_write_tokens > 0 {
            self.cache_write_tokens = later.cache_write_tokens;
        }
        if later.cache_read_tokens > 0 {
            self.cache_read_tokens = later.cache_read_tokens;
        }
    }

    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens)
            + u64::from(self.output_tokens)
            + u64::from(self.cache_write_tokens)
            + u64::from(self.cache_read_tokens)
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_write_tokens += rhs.cache_write_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
    }
}

/// Why a model turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    /// Map a transport stop reason. Anything unrecognized ends the turn.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
        }
    }
}

/// Everything one model turn produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Output text (all text blocks of the turn, concatenated)
    pub text: String,

    /// Tool calls, in the order the model emitted them
    pub tool_calls: Vec<ToolCall>,

    pub stop_reason: StopReason,

    pub usage: Usage,

    /// Thinking and redacted thinking blocks, in arrival order
    pub thinking_blocks: Vec<ContentBlock>,
}

/// An available model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

/// The core Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<Response, ProviderError>;

    /// Send a request and get an ordered stream of block lifecycle events.
    ///
    /// Default implementation calls `complete()` and replays the result as a
    /// synthetic event sequence.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let events = replay(&response);
        let (tx, rx) = tokio::sync::mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.send(Ok(event)).await;
        }
        Ok(rx)
    }

    /// List available models for this provider.
    async fn list_models(&self) -> std::result::Result<Vec<ModelInfo>, ProviderError> {
        Ok(Vec::new())
    }
}
