//! Domain event system: decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in a request or
//! background task. The core never depends on specific subscribers; a UI,
//! logger, or test can subscribe and filter for what it cares about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A request entered the pipeline
    RequestStarted {
        request_id: String,
        is_retry: bool,
        timestamp: DateTime<Utc>,
    },

    /// The agent loop began a turn
    TurnStarted {
        request_id: String,
        turn: u32,
        max_turns: u32,
        timestamp: DateTime<Utc>,
    },

    /// A model was resolved for the current turn
    ModelResolved {
        request_id: String,
        role: String,
        model_id: String,
        effort: String,
        timestamp: DateTime<Utc>,
    },

    /// An LLM call failed (transport or terminal)
    LlmCallFailed {
        request_id: String,
        recoverable: bool,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tool is suspended until someone answers a confirmation prompt
    ConfirmationRequested {
        confirmation_id: String,
        tool_name: String,
        path: String,
        timestamp: DateTime<Utc>,
    },

    /// The quality gate sent the request back through the pipeline
    RetryTriggered {
        parent_id: String,
        child_id: String,
        score: u8,
        timestamp: DateTime<Utc>,
    },

    /// A request produced its final response
    RequestCompleted {
        request_id: String,
        turns: u32,
        tool_calls: u32,
        timestamp: DateTime<Utc>,
    },

    /// A request aborted with an internal error
    RequestFailed {
        request_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// A background task changed status
    TaskStatusChanged {
        task_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// A background task reported progress (0–100)
    TaskProgress {
        task_id: String,
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// A background task emitted an output line
    TaskOutput {
        task_id: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Short label, handy for log lines and test assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestStarted { .. } => "request_started",
            Self::TurnStarted { .. } => "turn_started",
            Self::ModelResolved { .. } => "model_resolved",
            Self::LlmCallFailed { .. } => "llm_call_failed",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::RetryTriggered { .. } => "retry_triggered",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskOutput { .. } => "task_output",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Each engine owns its own bus, so a workspace task's sub-engine never
/// writes into the spawning session's bus.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
