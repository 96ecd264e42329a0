use async_trait::async_trait;
use tidewire_agent::AgentLoop;
use tidewire_core::history::HistoryStore;
use tidewire_core::request::RequestContext;
use tracing::debug;

use super::record_user_turn;
use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{Stage, StageFlow};

/// Runs the agent turn loop against the engine's conversation.
pub struct AgentLoopStage;

#[async_trait]
impl Stage for AgentLoopStage {
    fn name(&self) -> &'static str {
        "agent_loop"
    }

    fn skipped_on_fast_path(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        let agent = services.require::<AgentLoop>()?;
        let history = services.require::<dyn HistoryStore>()?;

        record_user_turn(ctx, history.as_ref());
        let summary = agent.run(ctx, history.as_ref()).await?;
        debug!(
            request_id = %ctx.id,
            exit = ?summary.exit,
            turns = summary.turns,
            tool_calls = summary.tool_calls,
            "Agent loop stage done"
        );
        Ok(StageFlow::Next)
    }
}
