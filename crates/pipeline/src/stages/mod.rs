//! The eight standard stages, in pipeline order.

mod agent;
mod finalize;
mod notify;
mod postprocess;
mod preprocess;
mod quality;
mod triage;
mod validate;

use std::sync::Arc;

use tidewire_core::history::HistoryStore;
use tidewire_core::message::Role;
use tidewire_core::request::RequestContext;

pub use agent::AgentLoopStage;
pub use finalize::{FinalizeStage, NO_RESPONSE};
pub use notify::InjectNotificationsStage;
pub use postprocess::{PostprocessStage, strip_reasoning_blocks};
pub use preprocess::{PreprocessStage, parse_directive};
pub use quality::{
    Evaluation, LlmQualityEvaluator, QualityEvaluator, QualityGate, QualityGateStage,
    improved_prompt,
};
pub use triage::{LlmTriage, Triage, TriageDecision, TriageStage, parse_triage_reply};
pub use validate::ValidateStage;

use crate::stage::Stage;

/// validate → inject notifications → preprocess → triage → agent loop →
/// quality gate → postprocess → finalize
pub fn standard_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(ValidateStage),
        Arc::new(InjectNotificationsStage),
        Arc::new(PreprocessStage),
        Arc::new(TriageStage),
        Arc::new(AgentLoopStage),
        Arc::new(QualityGateStage),
        Arc::new(PostprocessStage),
        Arc::new(FinalizeStage),
    ]
}

/// Append the request's user message to history, once per context.
pub(crate) fn record_user_turn(ctx: &mut RequestContext, history: &dyn HistoryStore) {
    if ctx.metadata.user_turn_recorded {
        return;
    }
    history.add_message(Role::User, &ctx.user_input);
    ctx.metadata.user_turn_recorded = true;
}
