//! `revloop agent`: Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use revloop_agent::{
    AgentLoop, AgentStreamEvent, ApprovalGate, BlockKind, ChatOutcome, Termination,
    ThinkingOptions, ToolApprover,
};
use revloop_config::AppConfig;
use revloop_core::tool::{ToolCall, ToolRegistry};
use revloop_providers::AnthropicProvider;
use revloop_store::ConversationStore;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use super::conversations::{preview, render};

/// Stdin shared by the prompt loop and the approver.
type SharedInput = Arc<Mutex<Lines<BufReader<Stdin>>>>;

pub async fn run(
    message: Option<String>,
    resume: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let provider = Arc::new(build_provider(&config)?);

    // Tools are supplied by the host application; the CLI registers none.
    let tools = Arc::new(ToolRegistry::new());
    let tool_count = tools.len();

    let input: SharedInput = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut agent = build_agent(&config, provider, tools, tx, input.clone())?;

    let mut store = ConversationStore::open(config.conversations_path())?;
    if let Some(id) = resume {
        let messages = store
            .load(&id)?
            .ok_or_else(|| format!("No conversation with id {id}"))?;
        agent.replace_messages(messages);
    } else {
        store.new_conversation();
    }

    // Ctrl-C cancels the running turn instead of killing the process.
    let cancel = agent.cancel_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut printer = EventPrinter::new(std::io::stdout());

    if let Some(msg) = message {
        // Single message mode
        let outcome = run_turn(&mut agent, &mut rx, &mut printer, msg).await;
        save(&mut store, &agent);
        report(&printer, &outcome?);
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  revloop: interactive mode");
    println!();
    println!("  Model:         {}", config.model);
    println!("  Tools:         {tool_count} registered");
    println!("  Streaming:     {}", config.streaming);
    println!("  Thinking:      {}", config.thinking.enabled);
    println!("  Conversation:  {}", store.current_id().map(|id| id.to_string()).unwrap_or_default());
    if !agent.messages().is_empty() {
        println!("  Resumed:       {} messages", agent.messages().len());
    }
    println!();
    println!("  Ctrl+C cancels the current turn. Type 'exit' or press Ctrl+D to quit.");
    println!("  Commands: /new, /model <id>, /usage, /history");
    println!();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = input.lock().await.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if line.starts_with('/') {
            slash_command(&line, &mut agent, &mut store);
            continue;
        }

        println!();
        match run_turn(&mut agent, &mut rx, &mut printer, line).await {
            Ok(outcome) => report(&printer, &outcome),
            Err(e) => eprintln!("  [Error] {e}"),
        }
        save(&mut store, &agent);
        println!();
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}

/// The transport configured for `config`.
pub(crate) fn build_provider(
    config: &AppConfig,
) -> Result<AnthropicProvider, Box<dyn std::error::Error>> {
    // Check for API key early: give a clear error
    let Some(api_key) = config.api_key.as_deref() else {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    ANTHROPIC_API_KEY=sk-ant-...");
        eprintln!("    REVLOOP_API_KEY=sk-ant-...");
        eprintln!();
        eprintln!("  Or add api_key to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    };

    let mut provider = AnthropicProvider::new(api_key);
    if let Some(url) = &config.api_url {
        provider = provider.with_base_url(url.as_str());
    }
    Ok(provider)
}

fn build_agent(
    config: &AppConfig,
    provider: Arc<AnthropicProvider>,
    tools: Arc<ToolRegistry>,
    events: mpsc::UnboundedSender<AgentStreamEvent>,
    input: SharedInput,
) -> revloop_core::Result<AgentLoop> {
    let mut agent = AgentLoop::new(provider, tools)
        .with_config(config.agent)?
        .with_model(config.model.as_str())
        .with_max_tokens(config.max_tokens)
        .with_caching(config.caching.enabled)
        .with_streaming(config.streaming)
        .with_events(events);

    if let Some(prompt) = &config.system_prompt {
        agent = agent.with_system_prompt(prompt.as_str());
    }
    if config.thinking.enabled {
        agent = agent.with_thinking(ThinkingOptions {
            budget_tokens: config.thinking.budget_tokens,
            interleaved: config.thinking.interleaved,
        });
    }
    if config.approval.required {
        agent = agent.with_approval(ApprovalGate::new(
            Arc::new(StdinApprover { input }),
            Duration::from_secs(config.approval.timeout_secs),
        ));
    }
    Ok(agent)
}

/// Run one `chat()` call, rendering events while it is in flight.
async fn run_turn<W: Write>(
    agent: &mut AgentLoop,
    rx: &mut mpsc::UnboundedReceiver<AgentStreamEvent>,
    printer: &mut EventPrinter<W>,
    text: String,
) -> revloop_core::Result<ChatOutcome> {
    printer.reset();
    let outcome = {
        let chat = agent.chat(text);
        tokio::pin!(chat);
        loop {
            tokio::select! {
                result = &mut chat => break result,
                Some(event) = rx.recv() => printer.handle(event),
            }
        }
    };
    while let Ok(event) = rx.try_recv() {
        printer.handle(event);
    }
    outcome
}

/// Print whatever the event stream did not already show.
fn report<W: Write>(printer: &EventPrinter<W>, outcome: &ChatOutcome) {
    match outcome.termination {
        Termination::Completed if printer.printed_text() => {}
        Termination::Completed => {
            for line in outcome.text.lines() {
                println!("  Assistant > {line}");
            }
        }
        Termination::Cancelled | Termination::ConsecutiveErrors => {
            eprintln!("  {}", outcome.text);
        }
        Termination::MaxIterations => {
            eprintln!("  Stopped after {} iterations.", outcome.iterations);
        }
    }
}

fn save(store: &mut ConversationStore, agent: &AgentLoop) {
    if let Err(e) = store.save(agent.messages()) {
        warn!(error = %e, "Failed to save conversation");
        eprintln!("  [Error] Could not save conversation: {e}");
    }
}

fn slash_command(line: &str, agent: &mut AgentLoop, store: &mut ConversationStore) {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();

    match command {
        "/new" => {
            agent.clear_history();
            let id = store.new_conversation();
            println!("  Started conversation {id}");
        }
        "/model" if !arg.is_empty() => {
            agent.set_model(arg);
            println!("  Model set to {arg}");
        }
        "/model" => println!("  Model: {}", agent.model()),
        "/usage" => {
            let usage = agent.session_usage();
            println!(
                "  Tokens: {} in, {} out, {} cache write, {} cache read",
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_write_tokens,
                usage.cache_read_tokens
            );
        }
        "/history" => {
            for message in agent.messages() {
                print!("{}", render(message));
            }
        }
        other => println!("  Unknown command: {other}"),
    }
}

/// Asks on the terminal before each tool call.
struct StdinApprover {
    input: SharedInput,
}

#[async_trait]
impl ToolApprover for StdinApprover {
    async fn approve(&self, call: &ToolCall) -> bool {
        eprint!(
            "  Allow {}({})? [y/N] ",
            call.name,
            preview(&call.input.to_string(), 120)
        );
        let _ = std::io::stderr().flush();
        match self.input.lock().await.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

/// Renders agent events to a terminal.
struct EventPrinter<W: Write> {
    out: W,
    /// Bytes of the current turn's text already written
    written: usize,
    printed_text: bool,
}

impl<W: Write> EventPrinter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            written: 0,
            printed_text: false,
        }
    }

    /// Forget the previous `chat()` call.
    fn reset(&mut self) {
        self.written = 0;
        self.printed_text = false;
    }

    fn printed_text(&self) -> bool {
        self.printed_text
    }

    fn handle(&mut self, event: AgentStreamEvent) {
        if let Err(e) = self.write_event(event) {
            warn!(error = %e, "Failed to render event");
        }
    }

    fn write_event(&mut self, event: AgentStreamEvent) -> std::io::Result<()> {
        match event {
            AgentStreamEvent::BlockStarted {
                kind: BlockKind::Thinking,
            } => writeln!(self.out, "  (thinking...)")?,
            AgentStreamEvent::BlockStarted { kind: BlockKind::Text } => {}
            AgentStreamEvent::ThinkingCompleted { thinking, .. } => {
                for line in thinking.lines() {
                    writeln!(self.out, "  │ {line}")?;
                }
            }
            AgentStreamEvent::RedactedThinking { .. } => writeln!(self.out, "  (redacted thinking)")?,
            AgentStreamEvent::TextCompleted { text } => {
                // Carries the whole turn's text; write only what is new.
                if let Some(new) = text.get(self.written..) {
                    if !new.is_empty() {
                        for line in new.lines() {
                            writeln!(self.out, "  Assistant > {line}")?;
                        }
                        self.printed_text = true;
                    }
                }
                self.written = text.len();
            }
            AgentStreamEvent::ToolStarted { .. } | AgentStreamEvent::ToolCompleted { .. } => {}
            AgentStreamEvent::ToolDispatched { call } => {
                writeln!(self.out, "  → {}({})", call.name, preview(&call.input.to_string(), 120))?;
            }
            AgentStreamEvent::ToolResult { result } => {
                let mark = if result.is_error { "✗" } else { "✓" };
                writeln!(self.out, "  {mark} {}", preview(&result.content, 120))?;
            }
            AgentStreamEvent::Usage { usage } => {
                tracing::debug!(
                    input = usage.input_tokens,
                    output = usage.output_tokens,
                    cache_read = usage.cache_read_tokens,
                    cache_write = usage.cache_write_tokens,
                    "Turn usage"
                );
            }
            AgentStreamEvent::Done => self.written = 0,
            AgentStreamEvent::Terminated { .. } => {}
        }
        self.out.flush()
    }
}
