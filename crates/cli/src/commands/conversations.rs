//! `revloop conversations`: Saved conversation management.

use revloop_config::AppConfig;
use revloop_core::message::{ContentBlock, Message, Role};
use revloop_store::ConversationStore;

fn open_store() -> Result<ConversationStore, Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    Ok(ConversationStore::open(config.conversations_path())?)
}

pub fn list() -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store()?;
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("No saved conversations in {}", store.dir().display());
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}  {}  {}",
            summary.id,
            summary.updated_at.format("%Y-%m-%d %H:%M"),
            summary.title
        );
    }
    Ok(())
}

pub fn show(id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = open_store()?;
    let messages = store
        .load(id)?
        .ok_or_else(|| format!("No conversation with id {id}"))?;
    println!("# {}", store.title(id));
    println!();
    for message in &messages {
        print!("{}", render(message));
    }
    Ok(())
}

pub fn delete(id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = open_store()?;
    if store.delete(id)? {
        println!("Deleted {id}");
        Ok(())
    } else {
        Err(format!("No conversation with id {id}").into())
    }
}

/// Plain-text transcript of one message.
pub(crate) fn render(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "You",
        Role::Assistant => "Assistant",
    };
    let mut out = String::new();
    for block in message.content.to_blocks() {
        let line = match block {
            ContentBlock::Text { text } if text.is_empty() => continue,
            ContentBlock::Text { text } => format!("{speaker} > {text}"),
            ContentBlock::Thinking { thinking, .. } => format!("  (thinking) {thinking}"),
            ContentBlock::RedactedThinking { .. } => "  (redacted thinking)".to_string(),
            ContentBlock::ToolUse { name, input, .. } => format!("  → {name}({input})"),
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                let mark = if is_error { "✗" } else { "✓" };
                format!("  {mark} {}", preview(&content, 200))
            }
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// First `max` characters of `text` on one line.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    } else {
        flat
    }
}
