//! Conversation persistence for revloop.
//!
//! One JSON file per conversation (`<id>.json`) holding the metadata and the
//! full message history exactly as the agent loop keeps it, so a loaded
//! history can be replayed to the model unchanged.
//!
//! Storage location: `~/.revloop/conversations/` unless configured otherwise.

use chrono::{DateTime, Utc};
use revloop_core::message::{Conversation, ConversationId, Message, MessageContent, Role};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Title used when no user text is available.
pub const DEFAULT_TITLE: &str = "New Conversation";

const TITLE_MAX_CHARS: usize = 50;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid conversation id: {0}")]
    InvalidId(String),

    #[error("Storage I/O failed at {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Failed to encode conversation: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Listing entry for a saved conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default = "untitled")]
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

fn untitled() -> String {
    "Untitled".into()
}

/// A directory of saved conversations plus the id of the one in use.
pub struct ConversationStore {
    dir: PathBuf,
    current: Option<ConversationId>,
}

impl ConversationStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        debug!(dir = %dir.display(), "Conversation store opened");
        Ok(Self { dir, current: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Id of the conversation saves go to.
    pub fn current_id(&self) -> Option<&ConversationId> {
        self.current.as_ref()
    }

    /// Start a new conversation and make it current.
    pub fn new_conversation(&mut self) -> ConversationId {
        let id = ConversationId::new();
        self.current = Some(id.clone());
        id
    }

    /// Save `messages` to the current conversation, creating one if needed.
    ///
    /// Empty histories are not written. `created_at` is kept from any
    /// earlier save of the same conversation.
    pub fn save(&mut self, messages: &[Message]) -> Result<Option<ConversationId>, StoreError> {
        if messages.is_empty() {
            return Ok(None);
        }

        let id = match &self.current {
            Some(id) => id.clone(),
            None => self.new_conversation(),
        };
        let path = self.path_for(&id.0)?;

        let now = Utc::now();
        let created_at = read_conversation(&path)
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let conversation = Conversation {
            id: id.clone(),
            title: derive_title(messages),
            created_at,
            updated_at: now,
            messages: messages.to_vec(),
        };

        let content = serde_json::to_string_pretty(&conversation)?;
        std::fs::write(&path, content).map_err(|e| StoreError::Io {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        debug!(id = %id, messages = messages.len(), "Conversation saved");
        Ok(Some(id))
    }

    /// Load a conversation's messages and make it current.
    ///
    /// Returns `None` when the file is missing or unreadable.
    pub fn load(&mut self, id: &str) -> Result<Option<Vec<Message>>, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        match read_conversation(&path) {
            Some(conversation) => {
                self.current = Some(ConversationId::from(id));
                Ok(Some(conversation.messages))
            }
            None => Ok(None),
        }
    }

    /// All saved conversations, most recently updated first.
    pub fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StoreError::Io {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;

        let mut summaries: Vec<ConversationSummary> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let content = std::fs::read_to_string(&path).ok()?;
                match serde_json::from_str::<ConversationSummary>(&content) {
                    Ok(mut summary) => {
                        if summary.id.is_empty() {
                            summary.id = file_stem(&path);
                        }
                        Some(summary)
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupted conversation file");
                        None
                    }
                }
            })
            .collect();

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Delete a conversation. Returns whether it existed.
    pub fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if self.current.as_ref().is_some_and(|current| current.0 == id) {
            self.current = None;
        }
        Ok(true)
    }

    /// Title of a saved conversation, or `"Untitled"`.
    pub fn title(&self, id: &str) -> String {
        self.path_for(id)
            .ok()
            .and_then(|path| read_conversation(&path))
            .map(|conversation| conversation.title)
            .unwrap_or_else(untitled)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

/// Title from the first user message when its content is plain text.
pub fn derive_title(messages: &[Message]) -> String {
    let Some(first_user) = messages.iter().find(|m| m.role == Role::User) else {
        return DEFAULT_TITLE.into();
    };
    let MessageContent::Text(text) = &first_user.content else {
        return DEFAULT_TITLE.into();
    };

    let mut title: String = text.chars().take(TITLE_MAX_CHARS).collect();
    title = title.trim().to_string();
    if text.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

fn read_conversation(path: &Path) -> Option<Conversation> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(conversation) => Some(conversation),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable conversation file");
            None
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_core::message::ContentBlock;
    use revloop_core::tool::ToolResult;

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(dir.path().join("conversations")).unwrap();
        (dir, store)
    }

    fn history() -> Vec<Message> {
        vec![
            Message::user("What does sub_401000 do?"),
            Message::assistant(vec![
                ContentBlock::Thinking {
                    thinking: "Decompile it first".into(),
                    signature: "EqQBCkYIARgCKkD+/sig==".into(),
                },
                ContentBlock::RedactedThinking {
                    data: "EmwKAhgBEgy3va3pzix/LafPsn4a".into(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_01".into(),
                    name: "decompile".into(),
                    input: serde_json::json!({"ea": "0x401000"}),
                },
            ]),
            Message::tool_results(vec![ToolResult::success("toolu_01", serde_json::json!("int main() {}"))]),
        ]
    }

    #[test]
    fn save_and_load_is_lossless() {
        let (_dir, mut store) = store();
        let messages = history();
        let id = store.save(&messages).unwrap().unwrap();

        let mut other = ConversationStore::open(store.dir()).unwrap();
        let loaded = other.load(&id.0).unwrap().unwrap();
        assert_eq!(loaded, messages);
        assert_eq!(other.current_id(), Some(&id));
    }

    #[test]
    fn empty_history_is_not_saved() {
        let (_dir, mut store) = store();
        assert!(store.save(&[]).unwrap().is_none());
        assert!(store.current_id().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn save_reuses_current_id_and_keeps_created_at() {
        let (_dir, mut store) = store();
        let mut messages = history();
        let first = store.save(&messages).unwrap().unwrap();
        let created = read_conversation(&store.dir().join(format!("{first}.json")))
            .unwrap()
            .created_at;

        messages.push(Message::user("and sub_402000?"));
        let second = store.save(&messages).unwrap().unwrap();
        assert_eq!(first, second);

        let saved = read_conversation(&store.dir().join(format!("{first}.json"))).unwrap();
        assert_eq!(saved.created_at, created);
        assert!(saved.updated_at >= created);
        assert_eq!(saved.messages.len(), 4);
    }

    #[test]
    fn titles() {
        assert_eq!(derive_title(&history()), "What does sub_401000 do?");
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);

        let long = "x".repeat(80);
        let title = derive_title(&[Message::user(long)]);
        assert_eq!(title, format!("{}...", "x".repeat(50)));

        let blocks_only = vec![Message::tool_results(vec![ToolResult::error("t", "boom")])];
        assert_eq!(derive_title(&blocks_only), DEFAULT_TITLE);
    }

    #[test]
    fn list_is_newest_first_and_skips_corrupt_files() {
        let (_dir, mut store) = store();
        store.new_conversation();
        let older = store.save(&[Message::user("older")]).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.new_conversation();
        let newer = store.save(&[Message::user("newer")]).unwrap().unwrap();
        std::fs::write(store.dir().join("broken.json"), "{not json").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, newer.0);
        assert_eq!(list[0].title, "newer");
        assert_eq!(list[1].id, older.0);
    }

    #[test]
    fn delete_clears_current() {
        let (_dir, mut store) = store();
        let id = store.save(&history()).unwrap().unwrap();
        assert!(store.delete(&id.0).unwrap());
        assert!(store.current_id().is_none());
        assert!(!store.delete(&id.0).unwrap());
        assert_eq!(store.title(&id.0), "Untitled");
    }

    #[test]
    fn load_missing_or_corrupt_returns_none() {
        let (_dir, mut store) = store();
        assert!(store.load("does-not-exist").unwrap().is_none());
        std::fs::write(store.dir().join("bad.json"), "[]").unwrap();
        assert!(store.load("bad").unwrap().is_none());
        assert!(store.current_id().is_none());
    }

    #[test]
    fn rejects_path_like_ids() {
        let (_dir, mut store) = store();
        assert!(matches!(store.load("../etc/passwd"), Err(StoreError::InvalidId(_))));
        assert!(matches!(store.delete(""), Err(StoreError::InvalidId(_))));
    }
}
