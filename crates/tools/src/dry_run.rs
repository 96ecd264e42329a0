//! Dry-run recording: mutating tool calls are logged as planned changes
//! instead of being performed.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A change a mutating tool would have made.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// Resolved paths the call would have touched
    pub paths: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct DryRunRecorder {
    changes: Mutex<Vec<PlannedChange>>,
}

impl DryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the change and return the text handed back to the model.
    pub fn record(&self, tool_name: &str, arguments: serde_json::Value, paths: Vec<String>) -> String {
        let target = if paths.is_empty() {
            String::new()
        } else {
            format!(" on {}", paths.join(", "))
        };
        let summary = format!("[DRY RUN] Would run '{tool_name}'{target}; no changes were made.");
        tracing::info!(tool = tool_name, paths = ?paths, "Dry run: change recorded");
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PlannedChange {
                tool_name: tool_name.to_string(),
                arguments,
                paths,
                recorded_at: Utc::now(),
            });
        summary
    }

    pub fn changes(&self) -> Vec<PlannedChange> {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.changes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
