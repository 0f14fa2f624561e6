//! # revloop Core
//!
//! Domain types, traits, and error definitions for the revloop agent runtime.
//! This crate has **no transport or storage dependencies**; it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is defined as a trait here (`Provider`, `Tool`).
//! Implementations live in their respective crates. This enables:
//! - Swapping the model transport or the tool set at construction time
//! - Easy testing with scripted providers and fake tools
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod provider;
pub mod stream;
pub mod tool;
pub mod agent;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ContentBlock, Conversation, ConversationId, Message, MessageContent, Role};
pub use provider::{Provider, ProviderRequest, Response, StopReason, ToolDefinition, Usage};
pub use stream::StreamEvent;
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
pub use agent::LoopConfig;
