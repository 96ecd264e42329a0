//! The pipeline driver.
//!
//! Stages run in order from an index; no stage calls the next one. A stage
//! that asks for a retry abandons the rest of the list: the driver swaps in
//! the child context and starts again from the first stage. Retry children
//! cannot retry again, so the outer loop runs at most twice.

use std::sync::Arc;

use chrono::Utc;
use tidewire_core::history::HistoryStore;
use tidewire_core::message::Role;
use tidewire_core::request::{RequestContext, StageError};
use tidewire_core::{DomainEvent, EventBus};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{RetryPlan, Stage, StageFlow};
use crate::stages::{record_user_turn, standard_stages};

/// What a request produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Id of the context that finished (the retry child after a retry)
    pub request_id: String,
    pub response: String,
    pub turns: u32,
    pub tool_calls: u32,
    pub retries: u32,
    /// Answered by triage without running the agent loop
    pub fast_path: bool,
    /// The pipeline aborted; `response` is the error text
    pub failed: bool,
    pub errors: Vec<StageError>,
}

impl PipelineOutput {
    fn from_context(ctx: &RequestContext, retries: u32) -> Self {
        Self {
            request_id: ctx.id.clone(),
            response: ctx.final_response().unwrap_or_default().to_string(),
            turns: ctx.turn_number,
            tool_calls: ctx.tool_call_count,
            retries,
            fast_path: ctx.skip_to_finalize,
            failed: false,
            errors: ctx.errors.clone(),
        }
    }
}

pub struct PipelineExecutor {
    stages: Vec<Arc<dyn Stage>>,
    services: Arc<ServiceRegistry>,
}

impl PipelineExecutor {
    /// The standard eight-stage pipeline.
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self::with_stages(services, standard_stages())
    }

    pub fn with_stages(services: Arc<ServiceRegistry>, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages, services }
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run `ctx` through the pipeline. After a quality-gate retry `ctx` is
    /// the child context; the returned output describes it.
    pub async fn execute(&self, ctx: &mut RequestContext) -> Result<PipelineOutput, PipelineError> {
        let mut retries = 0;

        'request: loop {
            self.publish(DomainEvent::RequestStarted {
                request_id: ctx.id.clone(),
                is_retry: ctx.is_retry,
                timestamp: Utc::now(),
            });
            info!(
                request_id = %ctx.id,
                is_retry = ctx.is_retry,
                parent_id = ctx.parent_id.as_deref().unwrap_or(""),
                "Request started"
            );

            let mut index = 0;
            while index < self.stages.len() {
                let stage = &self.stages[index];
                index += 1;

                if ctx.is_retry && !stage.runs_on_retry() {
                    debug!(request_id = %ctx.id, stage = stage.name(), "Skipped on retry");
                    continue;
                }
                if ctx.skip_to_finalize && stage.skipped_on_fast_path() {
                    debug!(request_id = %ctx.id, stage = stage.name(), "Skipped on fast path");
                    continue;
                }

                let flow = stage
                    .run(ctx, &self.services)
                    .await
                    .map_err(|e| e.in_stage(stage.name()))?;

                if let StageFlow::Retry(plan) = flow {
                    if ctx.is_retry {
                        warn!(
                            request_id = %ctx.id,
                            stage = stage.name(),
                            "Retry requested by a retry child, ignoring"
                        );
                        continue;
                    }
                    self.enter_retry(ctx, plan)?;
                    retries += 1;
                    continue 'request;
                }
            }
            break;
        }

        Ok(PipelineOutput::from_context(ctx, retries))
    }

    /// [`execute`](Self::execute) for callers that must always get a reply.
    ///
    /// On failure the error is logged and published, and the user turn plus
    /// an error reply are still recorded so the conversation stays usable.
    pub async fn execute_guarded(&self, ctx: &mut RequestContext) -> PipelineOutput {
        let error = match self.execute(ctx).await {
            Ok(output) => return output,
            Err(e) => e,
        };

        error!(request_id = %ctx.id, error = %error, "Request failed");
        self.publish(DomainEvent::RequestFailed {
            request_id: ctx.id.clone(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });

        let reply = format!("Error: {error}");
        ctx.record_error("pipeline", error.to_string());
        if let Some(history) = self.services.get::<dyn HistoryStore>() {
            record_user_turn(ctx, history.as_ref());
            history.add_message(Role::Assistant, &reply);
            if let Err(e) = history.persist().await {
                warn!(request_id = %ctx.id, error = %e, "Failed to persist history after failure");
            }
        }

        PipelineOutput {
            response: reply,
            failed: true,
            ..PipelineOutput::from_context(ctx, 0)
        }
    }

    fn enter_retry(&self, ctx: &mut RequestContext, plan: RetryPlan) -> Result<(), PipelineError> {
        let history = self.services.require::<dyn HistoryStore>()?;
        history.set_history(plan.preserved_history);

        let child = ctx.derive_retry(plan.improved_prompt);
        info!(
            parent_id = %ctx.id,
            child_id = %child.id,
            score = plan.score,
            "Quality gate triggered a retry"
        );
        self.publish(DomainEvent::RetryTriggered {
            parent_id: ctx.id.clone(),
            child_id: child.id.clone(),
            score: plan.score,
            timestamp: Utc::now(),
        });
        *ctx = child;
        Ok(())
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = self.services.get::<EventBus>() {
            events.publish(event);
        }
    }
}
