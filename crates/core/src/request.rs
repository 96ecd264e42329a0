//! Per-request mutable state threaded through every pipeline stage.
//!
//! One [`RequestContext`] exists per top-level request, plus one per
//! quality-gate retry. A context is never shared across concurrent requests.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::ReasoningEffort;

/// An error recorded by a stage without aborting the request.
#[derive(Debug, Clone, PartialEq)]
pub struct StageError {
    pub stage: String,
    pub error: String,
}

/// Free-form per-request metadata shared between stages.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Explicit reasoning-effort override (from a directive or the caller)
    pub reasoning_level: Option<ReasoningEffort>,

    /// Set once a direct-answer tool has produced an authoritative result
    pub direct_answer: bool,

    /// Turn on which the direct-answer tool fired
    pub direct_answer_turn: Option<u32>,

    /// Messages the user sent while this request was running
    pub chime_in: VecDeque<String>,

    /// System notes to show the model on the next turn (notifications)
    pub notices: Vec<String>,

    /// The user message for this request has been appended to history
    pub user_turn_recorded: bool,

    /// Retrieved-context/reasoning-state injections happened for this user turn
    pub context_injected: bool,

    /// System notes gathered by that injection, re-spliced on every turn
    pub injected_context: Vec<String>,

    /// The quality gate already sent this lineage back through the pipeline
    pub quality_retry_entered: bool,

    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Mutable per-request state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,

    /// The input exactly as the user sent it
    pub original_input: String,

    /// The input the pipeline works on (directive-stripped, or the improved retry prompt)
    pub user_input: String,

    pub is_retry: bool,
    pub retry_count: u32,

    /// Id of the context this one was derived from
    pub parent_id: Option<String>,

    pub turn_number: u32,
    pub max_turns: u32,
    pub tool_call_count: u32,
    pub errors: Vec<StageError>,

    /// Explicit model id, bypassing role resolution
    pub model: Option<String>,

    pub cancel: CancellationToken,
    pub metadata: RequestMetadata,

    /// Jump from triage straight to finalize
    pub skip_to_finalize: bool,

    pub started_at: DateTime<Utc>,

    final_response: Option<String>,
}

impl RequestContext {
    pub fn new(input: impl Into<String>, max_turns: u32) -> Self {
        let input = input.into();
        Self {
            id: Uuid::new_v4().to_string(),
            original_input: input.clone(),
            user_input: input,
            is_retry: false,
            retry_count: 0,
            parent_id: None,
            turn_number: 0,
            max_turns,
            tool_call_count: 0,
            errors: Vec::new(),
            model: None,
            cancel: CancellationToken::new(),
            metadata: RequestMetadata::default(),
            skip_to_finalize: false,
            started_at: Utc::now(),
            final_response: None,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_reasoning_level(mut self, level: ReasoningEffort) -> Self {
        self.metadata.reasoning_level = Some(level);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn final_response(&self) -> Option<&str> {
        self.final_response.as_deref()
    }

    pub fn has_final_response(&self) -> bool {
        self.final_response.is_some()
    }

    /// Set the final response. Only the first call wins; later calls are
    /// ignored and return `false`.
    pub fn set_final_response(&mut self, response: impl Into<String>) -> bool {
        if self.final_response.is_some() {
            tracing::warn!(request_id = %self.id, "Final response already set, ignoring");
            return false;
        }
        self.final_response = Some(response.into());
        true
    }

    /// Transform an already-set final response in place (post-processing).
    pub fn rewrite_final_response(&mut self, f: impl FnOnce(String) -> String) {
        if let Some(current) = self.final_response.take() {
            self.final_response = Some(f(current));
        }
    }

    /// Advance the turn counter. Returns `false` once `max_turns` is reached,
    /// leaving the counter untouched.
    pub fn begin_turn(&mut self) -> bool {
        if self.turn_number >= self.max_turns {
            return false;
        }
        self.turn_number += 1;
        true
    }

    pub fn turns_remaining(&self) -> u32 {
        self.max_turns.saturating_sub(self.turn_number)
    }

    pub fn record_error(&mut self, stage: impl Into<String>, error: impl Into<String>) {
        let err = StageError {
            stage: stage.into(),
            error: error.into(),
        };
        tracing::debug!(request_id = %self.id, stage = %err.stage, error = %err.error, "Stage error recorded");
        self.errors.push(err);
    }

    /// Build the child context for a quality-gate retry.
    ///
    /// The child starts a fresh turn counter with `improved_prompt` as its
    /// input. Its cancellation token is a child of this one, so aborting the
    /// parent aborts the retry.
    pub fn derive_retry(&self, improved_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original_input: self.original_input.clone(),
            user_input: improved_prompt.into(),
            is_retry: true,
            retry_count: self.retry_count + 1,
            parent_id: Some(self.id.clone()),
            turn_number: 0,
            max_turns: self.max_turns,
            tool_call_count: 0,
            errors: Vec::new(),
            model: self.model.clone(),
            cancel: self.cancel.child_token(),
            metadata: RequestMetadata {
                reasoning_level: self.metadata.reasoning_level,
                quality_retry_entered: true,
                ..RequestMetadata::default()
            },
            skip_to_finalize: false,
            started_at: Utc::now(),
            final_response: None,
        }
    }
}
