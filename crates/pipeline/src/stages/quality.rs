//! Post-hoc quality evaluation and the retry decision.
//!
//! The gate grades the final response together with the tool trail that
//! produced it. A score under the threshold yields a [`RetryPlan`]: the
//! conversation as it stands (tool calls and results included) plus an
//! improved prompt naming what was wrong and how to fix it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tidewire_core::error::ProviderError;
use tidewire_core::history::HistoryStore;
use tidewire_core::message::{Message, Role};
use tidewire_core::model::TaskRole;
use tidewire_core::request::RequestContext;
use tidewire_core::CancellationToken;
use tidewire_providers::ModelRouter;
use tracing::{debug, info, warn};

use crate::completion::complete;
use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{RetryPlan, Stage, StageFlow};

const EVALUATOR_PROMPT: &str = "You grade an assistant's answer to a user request. \
Consider correctness, completeness and whether the tool results support the answer. \
Reply with JSON only: {\"score\": <1-10>, \"issue\": \"<the main problem, or empty>\", \
\"remedy\": \"<one concrete instruction that would fix it, or empty>\"}";

/// Longest tool output quoted to the evaluator.
const TRAIL_EXCERPT_CHARS: usize = 600;

/// A graded response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Evaluation {
    /// 1 (useless) to 10 (excellent)
    pub score: u8,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub remedy: String,
}

impl Evaluation {
    /// Parse an evaluator reply, tolerating prose or code fences around the
    /// JSON object. Scores are clamped to 1..=10.
    pub fn parse(reply: &str) -> Result<Self, ProviderError> {
        let start = reply.find('{');
        let end = reply.rfind('}');
        let json = match (start, end) {
            (Some(start), Some(end)) if start < end => &reply[start..=end],
            _ => {
                return Err(ProviderError::MalformedResponse(
                    "evaluator reply holds no JSON object".into(),
                ));
            }
        };
        let mut evaluation: Self = serde_json::from_str(json)
            .map_err(|e| ProviderError::MalformedResponse(format!("evaluator reply: {e}")))?;
        evaluation.score = evaluation.score.clamp(1, 10);
        Ok(evaluation)
    }
}

#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    /// Grade `response` to `input`. `trail` is the conversation since the
    /// request's user message: tool calls and their results.
    async fn evaluate(
        &self,
        input: &str,
        response: &str,
        trail: &[Message],
        cancel: &CancellationToken,
    ) -> Result<Evaluation, ProviderError>;
}

/// Grading on the evaluator model.
pub struct LlmQualityEvaluator {
    router: Arc<ModelRouter>,
}

impl LlmQualityEvaluator {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }
}

fn render_trail(trail: &[Message]) -> String {
    let mut lines = Vec::new();
    for message in trail {
        match message.role {
            Role::Assistant => {
                for call in &message.tool_calls {
                    lines.push(format!("call {}({})", call.name(), call.function.arguments));
                }
            }
            Role::Tool => {
                let excerpt: String = message.content.chars().take(TRAIL_EXCERPT_CHARS).collect();
                lines.push(format!("result: {excerpt}"));
            }
            Role::User | Role::System => {}
        }
    }
    if lines.is_empty() {
        "(no tools were used)".into()
    } else {
        lines.join("\n")
    }
}

#[async_trait]
impl QualityEvaluator for LlmQualityEvaluator {
    async fn evaluate(
        &self,
        input: &str,
        response: &str,
        trail: &[Message],
        cancel: &CancellationToken,
    ) -> Result<Evaluation, ProviderError> {
        let question = format!(
            "Request:\n{input}\n\nTool trail:\n{}\n\nAnswer:\n{response}",
            render_trail(trail)
        );
        let reply = complete(
            &self.router,
            TaskRole::Evaluator,
            EVALUATOR_PROMPT,
            question,
            512,
            cancel,
        )
        .await?;
        Evaluation::parse(&reply)
    }
}

/// Decides whether a response is good enough or needs another pass.
pub struct QualityGate {
    evaluator: Arc<dyn QualityEvaluator>,
    threshold: u8,
}

impl QualityGate {
    pub fn new(evaluator: Arc<dyn QualityEvaluator>, threshold: u8) -> Self {
        Self {
            evaluator,
            threshold,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Grade the final response of `ctx`. Returns a retry plan when the
    /// score is below the threshold; `None` when it passes or cannot be
    /// graded.
    pub async fn evaluate_and_check_retry(
        &self,
        ctx: &RequestContext,
        history: &dyn HistoryStore,
    ) -> Option<RetryPlan> {
        let response = ctx.final_response()?;
        let trail: Vec<Message> = history
            .get_last_exchanges(1)
            .into_iter()
            .filter(|m| m.role != Role::User)
            .collect();

        let evaluation = match self
            .evaluator
            .evaluate(&ctx.original_input, response, &trail, &ctx.cancel)
            .await
        {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(request_id = %ctx.id, error = %e, "Quality evaluation failed, accepting response");
                return None;
            }
        };
        debug!(request_id = %ctx.id, score = evaluation.score, threshold = self.threshold, "Response graded");
        if evaluation.score >= self.threshold {
            return None;
        }

        info!(
            request_id = %ctx.id,
            score = evaluation.score,
            issue = %evaluation.issue,
            "Response below quality threshold"
        );
        Some(RetryPlan {
            improved_prompt: improved_prompt(&ctx.original_input, response, &evaluation),
            preserved_history: history.get_history(),
            score: evaluation.score,
        })
    }
}

/// The retry prompt: the original request, the answer that fell short and
/// what to do differently.
pub fn improved_prompt(original: &str, failed: &str, evaluation: &Evaluation) -> String {
    let issue = if evaluation.issue.trim().is_empty() {
        "it did not fully answer the request"
    } else {
        evaluation.issue.trim()
    };
    let remedy = if evaluation.remedy.trim().is_empty() {
        "answer the request completely and check your work against the tool results"
    } else {
        evaluation.remedy.trim()
    };
    format!(
        "{original}\n\nA previous attempt answered:\n{failed}\n\n\
         That answer fell short: {issue}\nTo improve it: {remedy}\n\
         The earlier tool calls and their results are still in the conversation; build on them."
    )
}

/// Sends weak responses back through the pipeline, once.
pub struct QualityGateStage;

#[async_trait]
impl Stage for QualityGateStage {
    fn name(&self) -> &'static str {
        "quality_gate"
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
        if ctx.metadata.quality_retry_entered || ctx.is_cancelled() {
            return Ok(StageFlow::Next);
        }
        let Some(gate) = services.get::<QualityGate>() else {
            return Ok(StageFlow::Next);
        };
        let history = services.require::<dyn HistoryStore>()?;

        match gate.evaluate_and_check_retry(ctx, history.as_ref()).await {
            Some(plan) => {
                ctx.metadata.quality_retry_entered = true;
                Ok(StageFlow::Retry(plan))
            }
            None => Ok(StageFlow::Next),
        }
    }
}
