//! Conversation history: the per-workspace message log the agent loop reads
//! from and appends to.
//!
//! Reads and appends are synchronous (the log lives in memory); only
//! [`HistoryStore::persist`] touches disk.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::HistoryError;
use crate::message::{Message, Role};

/// The history store interface.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The full conversation, oldest first.
    fn get_history(&self) -> Vec<Message>;

    /// Everything from the `n`-th most recent user message onwards.
    fn get_last_exchanges(&self, n: usize) -> Vec<Message> {
        last_exchanges(&self.get_history(), n)
    }

    /// Append a plain text message.
    fn add_message(&self, role: Role, content: &str) {
        let message = match role {
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
            Role::System => Message::system(content),
            Role::Tool => Message::tool_result("", "", content),
        };
        self.push_message(message);
    }

    /// Append a fully formed message (tool calls, tool results).
    fn push_message(&self, message: Message);

    /// Replace the whole conversation.
    fn set_history(&self, messages: Vec<Message>);

    fn len(&self) -> usize {
        self.get_history().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush to durable storage, if any.
    async fn persist(&self) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Slice `messages` from the `n`-th most recent user message. Returns the
/// whole list when it holds fewer than `n` user messages.
pub fn last_exchanges(messages: &[Message], n: usize) -> Vec<Message> {
    if n == 0 {
        return Vec::new();
    }
    let start = messages
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, m)| m.role == Role::User)
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    messages[start..].to_vec()
}

/// A history kept only in memory.
#[derive(Default)]
pub struct InMemoryHistory {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: RwLock::new(messages),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    fn get_history(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push_message(&self, message: Message) {
        self.messages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    fn set_history(&self, messages: Vec<Message>) {
        *self.messages.write().unwrap_or_else(|e| e.into_inner()) = messages;
    }

    fn len(&self) -> usize {
        self.messages.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A history backed by a JSON file, loaded on open and written on `persist`.
pub struct FileHistory {
    path: PathBuf,
    inner: InMemoryHistory,
}

impl FileHistory {
    /// Open `path`, loading any existing conversation. A missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let messages = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| HistoryError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(HistoryError::Load {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        tracing::debug!(path = %path.display(), messages = messages.len(), "History loaded");
        Ok(Self {
            path,
            inner: InMemoryHistory::with_messages(messages),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    fn get_history(&self) -> Vec<Message> {
        self.inner.get_history()
    }

    fn push_message(&self, message: Message) {
        self.inner.push_message(message);
    }

    fn set_history(&self, messages: Vec<Message>) {
        self.inner.set_history(messages);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    async fn persist(&self) -> Result<(), HistoryError> {
        let persist_err = |reason: String| HistoryError::Persist {
            path: self.path.display().to_string(),
            reason,
        };
        let json = serde_json::to_string_pretty(&self.get_history())
            .map_err(|e| persist_err(e.to_string()))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persist_err(e.to_string()))?;
        }
        // Write beside the target and rename so a crash never leaves half a file
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| persist_err(e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(persist_err(e.to_string()));
        }
        tracing::debug!(path = %self.path.display(), "History persisted");
        Ok(())
    }
}
