use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::error::ProviderError;
use tidewire_core::model::{ReasoningEffort, TaskRole};
use tidewire_core::request::RequestContext;
use tidewire_core::CancellationToken;
use tidewire_providers::ModelRouter;
use tracing::{debug, info, warn};

use crate::completion::complete;
use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{Stage, StageFlow};

const TRIAGE_PROMPT: &str = "You screen requests before a tool-using agent sees them. \
If the request can be answered correctly right now, in one short reply, without \
reading files, running tools or asking follow-up questions, reply exactly \
`COMPLETED: <answer>`. Otherwise reply exactly `CONTINUE`.";

/// What triage made of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriageDecision {
    /// Trivially answerable; the answer is final.
    Completed(String),
    Continue,
}

#[async_trait]
pub trait Triage: Send + Sync {
    async fn triage(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TriageDecision, ProviderError>;
}

/// Read a triage model's reply. Anything that is not a non-empty
/// `COMPLETED:` answer means continue.
pub fn parse_triage_reply(reply: &str) -> TriageDecision {
    let reply = reply.trim();
    let Some(prefix) = reply.get(..10) else {
        return TriageDecision::Continue;
    };
    if !prefix.eq_ignore_ascii_case("COMPLETED:") {
        return TriageDecision::Continue;
    }
    let answer = reply[10..].trim();
    if answer.is_empty() {
        TriageDecision::Continue
    } else {
        TriageDecision::Completed(answer.to_string())
    }
}

/// Triage on the fast model.
pub struct LlmTriage {
    router: Arc<ModelRouter>,
}

impl LlmTriage {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Triage for LlmTriage {
    async fn triage(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TriageDecision, ProviderError> {
        let reply = complete(
            &self.router,
            TaskRole::Fast,
            TRIAGE_PROMPT,
            input.to_string(),
            256,
            cancel,
        )
        .await?;
        Ok(parse_triage_reply(&reply))
    }
}

/// Answers trivial requests directly and marks them `skip_to_finalize`.
pub struct TriageStage;

#[async_trait]
impl Stage for TriageStage {
    fn name(&self) -> &'static str {
        "triage"
    }

    fn runs_on_retry(&self) -> bool {
        false
    }

    fn skipped_on_fast_path(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        let Some(triage) = services.get::<dyn Triage>() else {
            return Ok(StageFlow::Next);
        };
        // The user asked for depth; a one-line answer would not do
        if ctx.metadata.reasoning_level == Some(ReasoningEffort::High) {
            return Ok(StageFlow::Next);
        }

        match triage.triage(&ctx.user_input, &ctx.cancel).await {
            Ok(TriageDecision::Completed(answer)) => {
                info!(request_id = %ctx.id, "Triage answered directly");
                ctx.set_final_response(answer);
                ctx.skip_to_finalize = true;
            }
            Ok(TriageDecision::Continue) => {
                debug!(request_id = %ctx.id, "Triage passed the request on");
            }
            Err(ProviderError::Cancelled) => {}
            Err(e) => {
                warn!(request_id = %ctx.id, error = %e, "Triage failed, continuing without it");
                ctx.record_error("triage", e.to_string());
            }
        }
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_core::model::ModelConfig;
    use tidewire_providers::{ScriptStep, ScriptedProvider};

    fn router(provider: Arc<ScriptedProvider>) -> Arc<ModelRouter> {
        let model = ModelConfig {
            model_id: "fast".into(),
            provider: "scripted".into(),
            context_window: 8000,
            max_output_tokens: 500,
            supports_tool_calling: false,
            supports_reasoning_effort: false,
        };
        Arc::new(ModelRouter::new(model).with_provider("scripted", provider))
    }

    fn services(provider: Arc<ScriptedProvider>) -> ServiceRegistry {
        let triage: Arc<dyn Triage> = Arc::new(LlmTriage::new(router(provider)));
        ServiceRegistry::new().with(triage)
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(
            parse_triage_reply("COMPLETED: 4"),
            TriageDecision::Completed("4".into())
        );
        assert_eq!(
            parse_triage_reply("  completed:   Paris \n"),
            TriageDecision::Completed("Paris".into())
        );
        assert_eq!(parse_triage_reply("COMPLETED:"), TriageDecision::Continue);
        assert_eq!(parse_triage_reply("CONTINUE"), TriageDecision::Continue);
        assert_eq!(parse_triage_reply("The answer is 4"), TriageDecision::Continue);
        assert_eq!(parse_triage_reply("é"), TriageDecision::Continue);
    }

    #[tokio::test]
    async fn completed_sets_fast_path() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("COMPLETED: 4")]));
        let mut ctx = RequestContext::new("2+2?", 5);
        TriageStage.run(&mut ctx, &services(provider)).await.unwrap();
        assert!(ctx.skip_to_finalize);
        assert_eq!(ctx.final_response(), Some("4"));
    }

    #[tokio::test]
    async fn continue_leaves_request_alone() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("CONTINUE")]));
        let mut ctx = RequestContext::new("refactor the parser", 5);
        TriageStage.run(&mut ctx, &services(provider)).await.unwrap();
        assert!(!ctx.skip_to_finalize);
        assert!(!ctx.has_final_response());
    }

    #[tokio::test]
    async fn failures_are_recorded_not_raised() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::network_error()]));
        let mut ctx = RequestContext::new("hi", 5);
        TriageStage.run(&mut ctx, &services(provider)).await.unwrap();
        assert!(!ctx.skip_to_finalize);
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.errors[0].stage, "triage");
    }

    #[tokio::test]
    async fn deep_requests_skip_triage() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("COMPLETED: 4")]));
        let mut ctx = RequestContext::new("2+2?", 5).with_reasoning_level(ReasoningEffort::High);
        TriageStage
            .run(&mut ctx, &services(provider.clone()))
            .await
            .unwrap();
        assert!(!ctx.skip_to_finalize);
        assert_eq!(provider.call_count(), 0);
    }
}
