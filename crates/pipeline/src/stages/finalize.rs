use async_trait::async_trait;
use chrono::Utc;
use tidewire_core::history::HistoryStore;
use tidewire_core::message::Role;
use tidewire_core::request::RequestContext;
use tidewire_core::{DomainEvent, EventBus};
use tracing::{info, warn};

use super::record_user_turn;
use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{Stage, StageFlow};

/// Used when no stage produced a response.
pub const NO_RESPONSE: &str = "No response was produced.";

/// Records the exchange in history, persists it and announces completion.
/// Runs for every request that does not abort, fast path included.
pub struct FinalizeStage;

#[async_trait]
impl Stage for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        let history = services.require::<dyn HistoryStore>()?;

        if !ctx.has_final_response() {
            ctx.set_final_response(NO_RESPONSE);
        }
        let response = ctx.final_response().unwrap_or(NO_RESPONSE).to_string();

        record_user_turn(ctx, history.as_ref());
        history.add_message(Role::Assistant, &response);
        if let Err(e) = history.persist().await {
            warn!(request_id = %ctx.id, error = %e, "Failed to persist history");
            ctx.record_error("finalize", e.to_string());
        }

        if let Some(events) = services.get::<EventBus>() {
            events.publish(DomainEvent::RequestCompleted {
                request_id: ctx.id.clone(),
                turns: ctx.turn_number,
                tool_calls: ctx.tool_call_count,
                timestamp: Utc::now(),
            });
        }
        info!(
            request_id = %ctx.id,
            turns = ctx.turn_number,
            tool_calls = ctx.tool_call_count,
            retry = ctx.is_retry,
            elapsed_ms = (Utc::now() - ctx.started_at).num_milliseconds(),
            "Request finished"
        );
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidewire_core::history::InMemoryHistory;

    #[tokio::test]
    async fn records_exchange_and_publishes() {
        let history = Arc::new(InMemoryHistory::new());
        let events = Arc::new(EventBus::new(8));
        let mut rx = events.subscribe();
        let store: Arc<dyn HistoryStore> = history.clone();
        let services = ServiceRegistry::new().with(store).with(events);

        let mut ctx = RequestContext::new("2+2?", 5);
        ctx.set_final_response("4");
        FinalizeStage.run(&mut ctx, &services).await.unwrap();

        let messages = history.get_history();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "4");
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::RequestCompleted { turns: 0, .. }
        ));
    }

    #[tokio::test]
    async fn user_turn_is_not_recorded_twice() {
        let history = Arc::new(InMemoryHistory::new());
        let store: Arc<dyn HistoryStore> = history.clone();
        let services = ServiceRegistry::new().with(store);

        let mut ctx = RequestContext::new("hi", 5);
        history.add_message(Role::User, "hi");
        ctx.metadata.user_turn_recorded = true;
        FinalizeStage.run(&mut ctx, &services).await.unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.get_history()[1].content, NO_RESPONSE);
    }
}
