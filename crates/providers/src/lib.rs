//! LLM Provider implementations for revloop.
//!
//! All providers implement the `revloop_core::Provider` trait.

pub mod anthropic;
pub mod sse;

pub use anthropic::AnthropicProvider;
