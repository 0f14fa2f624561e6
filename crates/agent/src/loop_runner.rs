//! The agent reasoning loop implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use revloop_core::message::{ContentBlock, Message};
use revloop_core::provider::{Provider, ProviderRequest, Response, StopReason, ThinkingConfig, Usage};
use revloop_core::tool::{ToolCall, ToolRegistry, ToolResult};
use revloop_core::{Error, LoopConfig, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approval::ApprovalGate;
use crate::cache::CacheAnnotator;
use crate::decoder;
use crate::dispatch::ToolDispatcher;
use crate::doom::{SignatureWindow, ToolSignature};
use crate::stream_event::AgentStreamEvent;

/// Final text of a cancelled `chat()` call.
pub const CANCELLED_TEXT: &str = "[Cancelled by user]";
/// Result content for tool calls skipped by cancellation.
pub const CANCELLED_RESULT: &str = "Cancelled by user";
pub const DOOM_LOOP_RESULT: &str =
    "Detected repeated identical tool call. Please try a different approach.";
pub const REJECTED_RESULT: &str = "Tool call rejected by user";
pub const SKIPPED_RESULT: &str = "Not executed: stopped due to repeated errors";

const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are revloop, an assistant for reverse engineering work. You analyze \
binaries through the tools the host provides: reading disassembly and \
decompiled code, following cross references, searching for strings and \
byte patterns, and annotating the database with names and comments.

# Style
- Be brief. Output is shown in a terminal and rendered as GitHub-flavored markdown.
- Report facts you verified with a tool. Say so when something is a guess.
- Disagree with the user when the evidence does.

# Working with tools
- Read code before proposing changes to it.
- Independent tool calls can go in one response; dependent calls go one at a time.
- Never invent addresses or arguments. Look them up.
- If decompilation fails, fall back to disassembly.
";

/// Why a `chat()` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model ended its turn without requesting tools.
    Completed,
    /// The cancel flag was observed.
    Cancelled,
    /// Too many tool calls failed in a row.
    ConsecutiveErrors,
    /// The iteration cap was reached.
    MaxIterations,
}

/// What a `chat()` call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub text: String,
    pub termination: Termination,
    /// Model requests made
    pub iterations: u32,
}

/// Shared, thread-safe cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Observed at the top of the next iteration and
    /// before each tool call; a tool already running is not interrupted.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Extended thinking settings for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingOptions {
    pub budget_tokens: u32,
    /// Allow reasoning between tool calls (beta header)
    pub interleaved: bool,
}

enum CallOutcome {
    Success(serde_json::Value),
    Failed(String),
    Denied(String),
}

enum BatchOutcome {
    Continue,
    Cancelled,
    TooManyErrors(String),
}

/// The core agent loop that orchestrates LLM calls and tool execution.
///
/// Owns the conversation. `chat()` takes `&mut self`, so one turn runs at a
/// time and the history cannot change underneath it.
pub struct AgentLoop {
    /// The LLM provider to use
    provider: Arc<dyn Provider>,

    dispatcher: ToolDispatcher,

    config: LoopConfig,

    /// The model to use
    model: String,

    /// Max tokens per response
    max_tokens: u32,

    thinking: Option<ThinkingOptions>,

    cache: CacheAnnotator,

    /// Use the streaming transport
    streaming: bool,

    system_prompt: String,

    approval: Option<ApprovalGate>,

    events: Option<mpsc::UnboundedSender<AgentStreamEvent>>,

    messages: Vec<Message>,

    signatures: SignatureWindow,

    cancel: CancelHandle,

    session_usage: Usage,
}

impl AgentLoop {
    /// Create a new agent loop with default settings.
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>) -> Self {
        let config = LoopConfig::default();
        Self {
            provider,
            dispatcher: ToolDispatcher::new(tools),
            config,
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 8192,
            thinking: None,
            cache: CacheAnnotator::new(true),
            streaming: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            approval: None,
            events: None,
            messages: Vec::new(),
            signatures: SignatureWindow::new(config.doom_loop_threshold),
            cancel: CancelHandle::new(),
            session_usage: Usage::default(),
        }
    }

    /// Set the loop limits. Every limit must be at least 1.
    pub fn with_config(mut self, config: LoopConfig) -> Result<Self> {
        config.validate().map_err(|message| Error::Config { message })?;
        self.config = config;
        self.signatures.set_threshold(config.doom_loop_threshold);
        Ok(self)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the max tokens per LLM response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    /// Enable extended thinking.
    pub fn with_thinking(mut self, options: ThinkingOptions) -> Self {
        self.thinking = Some(options);
        self
    }

    /// Enable or disable prompt cache markers.
    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.cache = CacheAnnotator::new(enabled);
        self
    }

    /// Choose between the streaming and single-response transport paths.
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Replace the built-in system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Require approval before every tool call.
    pub fn with_approval(mut self, gate: ApprovalGate) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Subscribe a channel to lifecycle events.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentStreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// A handle that cancels the running (or next) `chat()` call.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The conversation so far.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replace the whole conversation (e.g. a loaded one).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.signatures.clear();
    }

    /// Drop every message from `len` on (edit and redo).
    pub fn truncate_messages(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    /// Clear the conversation and repeat-call history.
    pub fn clear_history(&mut self) {
        self.messages.clear();
        self.signatures.clear();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Usage summed over every turn of this instance.
    pub fn session_usage(&self) -> Usage {
        self.session_usage
    }

    /// Send a user message and run the loop until it terminates.
    ///
    /// Transport failures propagate; the history keeps every message
    /// appended before the failure and stays structurally valid.
    pub async fn chat(&mut self, text: impl Into<String>) -> Result<ChatOutcome> {
        self.messages.push(Message::user(text));
        self.cancel.reset();

        info!(
            model = %self.model,
            messages = self.messages.len(),
            "Processing user message"
        );

        let mut iterations: u32 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut last_text = String::new();

        let (text, termination) = loop {
            if self.cancel.is_cancelled() {
                info!(iterations, "Cancelled");
                break (CANCELLED_TEXT.to_string(), Termination::Cancelled);
            }
            if iterations >= self.config.max_iterations {
                warn!(iterations, "Max iterations reached");
                break (last_text, Termination::MaxIterations);
            }
            iterations += 1;

            debug!(iteration = iterations, messages = self.messages.len(), "Agent loop iteration");

            let response = self.request_turn().await?;
            self.session_usage += response.usage;
            self.messages.push(assistant_message(&response));
            last_text = response.text.clone();

            if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
                break (response.text, Termination::Completed);
            }

            debug!(tool_count = response.tool_calls.len(), "Executing tool calls");

            match self.run_tools(&response.tool_calls, &mut consecutive_errors).await {
                BatchOutcome::Continue => {}
                BatchOutcome::Cancelled => {
                    info!(iterations, "Cancelled during tool calls");
                    break (CANCELLED_TEXT.to_string(), Termination::Cancelled);
                }
                BatchOutcome::TooManyErrors(error) => {
                    warn!(consecutive_errors, error = %error, "Stopping after repeated tool errors");
                    break (
                        format!("Stopped due to repeated errors: {error}"),
                        Termination::ConsecutiveErrors,
                    );
                }
            }
        };

        self.emit(AgentStreamEvent::Terminated {
            termination,
            iterations,
        });

        Ok(ChatOutcome {
            text,
            termination,
            iterations,
        })
    }

    fn build_request(&self) -> ProviderRequest {
        let mut extra_headers = Vec::new();
        if self.thinking.is_some_and(|t| t.interleaved) {
            extra_headers.push(("anthropic-beta".to_string(), INTERLEAVED_THINKING_BETA.to_string()));
        }

        ProviderRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: self.cache.messages(&self.messages),
            tools: self.cache.tools(self.dispatcher.definitions()),
            system: self.cache.system(&self.system_prompt),
            thinking: self.thinking.map(|t| ThinkingConfig::Enabled {
                budget_tokens: t.budget_tokens,
            }),
            stream: self.streaming,
            extra_headers,
        }
    }

    /// One model request, decoded into a response.
    async fn request_turn(&self) -> Result<Response> {
        let request = self.build_request();

        if self.streaming {
            let stream = self.provider.stream(request).await?;
            Ok(decoder::decode(stream, self.events.as_ref()).await?)
        } else {
            let response = self.provider.complete(request).await?;
            self.emit(AgentStreamEvent::Usage {
                usage: response.usage,
            });
            Ok(response)
        }
    }

    /// Handle one batch of tool calls and append their results.
    ///
    /// Every call gets exactly one result, in call order, even when the
    /// batch stops early.
    async fn run_tools(&mut self, calls: &[ToolCall], consecutive_errors: &mut u32) -> BatchOutcome {
        let mut results = Vec::with_capacity(calls.len());
        let mut outcome = BatchOutcome::Continue;

        for call in calls {
            let result = match outcome {
                BatchOutcome::Cancelled => ToolResult::error(&call.id, CANCELLED_RESULT),
                BatchOutcome::TooManyErrors(_) => ToolResult::error(&call.id, SKIPPED_RESULT),
                BatchOutcome::Continue => {
                    let (result, next) = self.handle_call(call, consecutive_errors).await;
                    outcome = next;
                    result
                }
            };

            self.emit(AgentStreamEvent::ToolResult {
                result: result.clone(),
            });
            results.push(result);
        }

        self.messages.push(Message::tool_results(results));
        outcome
    }

    /// One call of a batch that is still running: its result and whether
    /// the batch may go on.
    async fn handle_call(&mut self, call: &ToolCall, consecutive_errors: &mut u32) -> (ToolResult, BatchOutcome) {
        if self.cancel.is_cancelled() {
            info!(tool = %call.name, "Cancellation observed, skipping remaining tool calls");
            return (ToolResult::error(&call.id, CANCELLED_RESULT), BatchOutcome::Cancelled);
        }

        match self.run_call(call).await {
            CallOutcome::Success(value) => {
                *consecutive_errors = 0;
                (ToolResult::success(&call.id, value), BatchOutcome::Continue)
            }
            CallOutcome::Denied(reason) => (ToolResult::error(&call.id, reason), BatchOutcome::Continue),
            CallOutcome::Failed(error) => {
                *consecutive_errors += 1;
                warn!(tool = %call.name, error = %error, consecutive_errors = *consecutive_errors, "Tool call failed");
                let result = ToolResult::error(&call.id, &error);
                if *consecutive_errors >= self.config.max_consecutive_errors {
                    (result, BatchOutcome::TooManyErrors(error))
                } else {
                    (result, BatchOutcome::Continue)
                }
            }
        }
    }

    /// Repeat check, approval, then dispatch.
    async fn run_call(&mut self, call: &ToolCall) -> CallOutcome {
        if self.signatures.observe(ToolSignature::of(&call.name, &call.input)) {
            warn!(tool = %call.name, "Repeated identical tool call, not dispatching");
            return CallOutcome::Failed(DOOM_LOOP_RESULT.to_string());
        }

        if let Some(gate) = &self.approval {
            let decision = gate.check(call).await;
            if !decision.is_approved() {
                info!(tool = %call.name, ?decision, "Tool call not approved");
                return CallOutcome::Denied(REJECTED_RESULT.to_string());
            }
        }

        debug!(tool = %call.name, id = %call.id, "Dispatching tool call");
        self.emit(AgentStreamEvent::ToolDispatched { call: call.clone() });
        match self.dispatcher.execute(&call.name, call.input.clone()).await {
            Ok(value) => CallOutcome::Success(value),
            Err(e) => CallOutcome::Failed(e.to_string()),
        }
    }

    fn emit(&self, event: AgentStreamEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// The assistant message for a response: reasoning first, then text, then
/// tool calls. Never empty.
fn assistant_message(response: &Response) -> Message {
    let mut blocks: Vec<ContentBlock> = response.thinking_blocks.clone();
    if !response.text.is_empty() {
        blocks.push(ContentBlock::text(response.text.clone()));
    }
    blocks.extend(response.tool_calls.iter().map(ContentBlock::from));
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }
    Message::assistant(blocks)
}
