//! Tool dispatch.
//!
//! A thin layer over the registry that reduces every failure to one of two
//! categories the orchestrator understands.

use std::sync::Arc;

use revloop_core::error::ToolError;
use revloop_core::provider::ToolDefinition;
use revloop_core::tool::ToolRegistry;
use tracing::debug;

/// Why a dispatch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    /// The handler returned an error; `kind` names its category.
    #[error("{kind}: {message}")]
    Handler { kind: String, message: String },
}

/// Resolves tool names against a shared registry and runs them.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Definitions of every registered tool, in name order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Run one tool. Awaited inline; no retries.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError> {
        let Some(tool) = self.registry.get(name) else {
            return Err(DispatchError::NotFound(name.to_string()));
        };

        let start = std::time::Instant::now();
        let result = tool.execute(input).await;
        debug!(tool = name, duration_ms = start.elapsed().as_millis() as u64, ok = result.is_ok(), "Tool executed");

        // Anything the handler raises is a handler error, whatever its kind.
        result.map_err(|e: ToolError| DispatchError::Handler {
            kind: e.kind().to_string(),
            message: e.to_string(),
        })
    }
}
