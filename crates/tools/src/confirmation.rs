//! Confirmation gate: suspends a tool call that reaches outside the
//! workspace until a human (or UI) decides.
//!
//! Each request is a oneshot channel keyed by a generated id. The decision
//! arrives through [`ConfirmationGate::resolve`]; a timeout or cancellation
//! counts as a denial. "Always allow" remembers the parent directory so later
//! accesses beneath it skip the prompt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tidewire_core::{CancellationToken, DomainEvent, EventBus};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A decision on a pending confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AllowOnce,
    AlwaysAllow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// A confirmation waiting for a decision.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub id: String,
    pub tool_name: String,
    pub path: PathBuf,
    pub requested_at: DateTime<Utc>,
}

struct Pending {
    request: ConfirmationRequest,
    sender: oneshot::Sender<Decision>,
}

pub struct ConfirmationGate {
    pending: Mutex<HashMap<String, Pending>>,
    allowed_dirs: RwLock<Vec<PathBuf>>,
    timeout: Duration,
    /// Answer every request immediately (headless runs)
    auto_decision: Option<Decision>,
    events: Option<Arc<EventBus>>,
}

impl ConfirmationGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            allowed_dirs: RwLock::new(Vec::new()),
            timeout,
            auto_decision: None,
            events: None,
        }
    }

    /// A gate that never waits: every request gets `decision`.
    pub fn auto(decision: Decision) -> Self {
        let mut gate = Self::new(Duration::ZERO);
        gate.auto_decision = Some(decision);
        gate
    }

    /// Publish `ConfirmationRequested` events so a UI can find pending ids.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Whether `path` lies under a directory the user always allowed.
    pub fn is_preapproved(&self, path: &Path) -> bool {
        self.allowed_dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|dir| path.starts_with(dir))
    }

    /// Ask for permission for `tool_name` to touch `path` (already resolved).
    pub async fn confirm(&self, tool_name: &str, path: &Path, cancel: &CancellationToken) -> Decision {
        if self.is_preapproved(path) {
            debug!(tool = tool_name, path = %path.display(), "Path pre-approved");
            return Decision::AllowOnce;
        }

        if let Some(decision) = self.auto_decision {
            self.remember(decision, path);
            return decision;
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let request = ConfirmationRequest {
            id: id.clone(),
            tool_name: tool_name.to_string(),
            path: path.to_path_buf(),
            requested_at: Utc::now(),
        };
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.clone(),
                Pending {
                    request,
                    sender: tx,
                },
            );

        if let Some(events) = &self.events {
            events.publish(DomainEvent::ConfirmationRequested {
                confirmation_id: id.clone(),
                tool_name: tool_name.to_string(),
                path: path.display().to_string(),
                timestamp: Utc::now(),
            });
        }
        info!(confirmation_id = %id, tool = tool_name, path = %path.display(), "Awaiting confirmation");

        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(confirmation_id = %id, "Confirmation abandoned on cancel");
                Decision::Deny
            }
            result = tokio::time::timeout(self.timeout, rx) => match result {
                Ok(Ok(decision)) => decision,
                Ok(Err(_)) => Decision::Deny,
                Err(_) => {
                    warn!(confirmation_id = %id, "Confirmation timed out, denying");
                    Decision::Deny
                }
            },
        };

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.remember(decision, path);
        decision
    }

    /// Deliver a decision. Returns `false` if no such request is pending.
    pub fn resolve(&self, id: &str, decision: Decision) -> bool {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match pending {
            Some(p) => {
                // Receiver may have timed out already
                let _ = p.sender.send(decision);
                info!(confirmation_id = %id, ?decision, "Confirmation resolved");
                true
            }
            None => false,
        }
    }

    /// All requests still waiting for a decision.
    pub fn pending(&self) -> Vec<ConfirmationRequest> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| p.request.clone())
            .collect()
    }

    fn remember(&self, decision: Decision, path: &Path) {
        if decision != Decision::AlwaysAllow {
            return;
        }
        let dir = if path.is_dir() {
            path.to_path_buf()
        } else {
            path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf())
        };
        let mut allowed = self.allowed_dirs.write().unwrap_or_else(|e| e.into_inner());
        if allowed.iter().any(|known| dir.starts_with(known)) {
            return;
        }
        // A wider grant replaces the narrower ones it covers
        allowed.retain(|known| !known.starts_with(&dir));
        debug!(dir = %dir.display(), "Directory always allowed");
        allowed.push(dir);
    }
}
