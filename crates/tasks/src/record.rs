//! Task records and their lifecycle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::output::OutputLog;

/// queued → running → {completed | failed | cancelled}. Cancellation is
/// also allowed straight from queued. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs in the spawning engine's workspace
    InProcess,
    /// Runs in its own engine rooted at another directory
    Workspace,
}

/// Where a workspace task runs and where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    /// The directory did not exist and was created for this task
    pub dir_created: bool,
    pub origin_workspace: Option<PathBuf>,
    pub origin_conversation: Option<String>,
}

/// A snapshot of one task. The manager owns the live record; callers get
/// clones.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub query: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// The user has been told about the outcome
    pub read: bool,
    pub output_log: OutputLog,
    /// 0–100
    pub progress: u8,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub workspace: Option<WorkspaceInfo>,
}

impl TaskRecord {
    pub(crate) fn new(
        id: String,
        description: String,
        query: String,
        kind: TaskKind,
        log_capacity: usize,
    ) -> Self {
        Self {
            id,
            description,
            query,
            kind,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            read: false,
            output_log: OutputLog::new(log_capacity),
            progress: 0,
            metadata: serde_json::Map::new(),
            workspace: None,
        }
    }

    /// One line for listings and notifications.
    pub fn summary(&self) -> String {
        let head = format!("[{}] {} ({})", self.status, self.description, self.id);
        match self.status {
            TaskStatus::Completed => match &self.result {
                Some(result) => format!("{head}: {}", excerpt(result, 200)),
                None => head,
            },
            TaskStatus::Failed => format!(
                "{head}: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            TaskStatus::Running => format!("{head} {}%", self.progress),
            TaskStatus::Queued | TaskStatus::Cancelled => head,
        }
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let cut: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{cut}…")
    } else {
        cut
    }
}
