//! The agent loop for revloop.
//!
//! One `chat()` call runs a **request → decode → dispatch** cycle:
//!
//! 1. **Annotate** the history with prompt cache markers
//! 2. **Request** a model turn and decode its event stream into a response
//! 3. **If tool calls**: check for repeats, ask for approval, dispatch, append results, loop
//! 4. **Otherwise**: return the final text
//!
//! The loop also stops on cancellation, on too many failed tool calls in a
//! row, and at the iteration cap.

pub mod approval;
pub mod cache;
pub mod decoder;
pub mod dispatch;
pub mod doom;
pub mod loop_runner;
pub mod stream_event;

pub use approval::{ApprovalDecision, ApprovalGate, ToolApprover};
pub use cache::CacheAnnotator;
pub use decoder::StreamDecoder;
pub use dispatch::{DispatchError, ToolDispatcher};
pub use doom::{SignatureWindow, ToolSignature};
pub use loop_runner::{AgentLoop, CancelHandle, ChatOutcome, Termination, ThinkingOptions};
pub use stream_event::{AgentStreamEvent, BlockKind};
