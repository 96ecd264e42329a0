use async_trait::async_trait;
use tidewire_agent::CANCELLED_RESPONSE;
use tidewire_core::history::HistoryStore;
use tidewire_core::request::RequestContext;
use tracing::debug;

use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::services::Subsystems;
use crate::stage::{Stage, StageFlow};

/// Rejects unusable input, short-circuits already-cancelled requests and
/// loads lazy subsystems.
pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        services.require::<dyn HistoryStore>()?;

        if ctx.is_cancelled() {
            debug!(request_id = %ctx.id, "Request cancelled before it started");
            ctx.set_final_response(CANCELLED_RESPONSE);
            ctx.skip_to_finalize = true;
            return Ok(StageFlow::Next);
        }
        if ctx.user_input.trim().is_empty() {
            return Err(PipelineError::InvalidInput("the request is empty".into()));
        }

        if let Some(subsystems) = services.get::<Subsystems>() {
            for (name, error) in subsystems.ensure_loaded().await {
                ctx.record_error("validate", format!("subsystem '{name}' unavailable: {error}"));
            }
        }
        Ok(StageFlow::Next)
    }
}
