//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what let the model act on the analysis target: decompile a
//! function, rename a symbol, list cross references. The concrete tool set
//! is supplied by the host; this module only defines the contract and the
//! registry the agent loop dispatches through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID within the turn (matches the `tool_use` block id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Input object
    pub input: serde_json::Value,
}

/// The outcome of one tool call, as fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result answers
    pub tool_use_id: String,

    /// Rendered output (or error description)
    pub content: String,

    /// Whether the call failed
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// A successful result. Strings pass through; other values are JSON encoded.
    pub fn success(tool_use_id: impl Into<String>, value: serde_json::Value) -> Self {
        let content = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Self {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    /// A failed result. The content is rendered as `Error: <message>`.
    pub fn error(tool_use_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: format!("Error: {message}"),
            is_error: true,
        }
    }
}

/// The core Tool trait.
///
/// Implementations may block for a while (for example when they hand work to
/// a UI thread of the host application); the agent loop awaits them inline.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "decompile", "rename").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input object.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// A registry of available tools.
///
/// Constructed once by the host and shared with the agent loop. Definitions
/// are listed in name order so the tool list (and therefore the cached
/// request prefix) is stable between requests.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(input).await
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
