use async_trait::async_trait;
use tidewire_core::model::ReasoningEffort;
use tidewire_core::request::RequestContext;
use tracing::debug;

use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{Stage, StageFlow};

const DIRECTIVES: [(&str, ReasoningEffort); 2] = [
    ("/deep", ReasoningEffort::High),
    ("/quick", ReasoningEffort::Low),
];

/// Split a leading reasoning directive off `input`.
///
/// Returns the directive, its effort and the remaining text. A directive
/// must be followed by whitespace or end the input, so `/deeply` is not one.
pub fn parse_directive(input: &str) -> Option<(&'static str, ReasoningEffort, &str)> {
    let trimmed = input.trim_start();
    DIRECTIVES.iter().find_map(|(directive, effort)| {
        let rest = trimmed.strip_prefix(directive)?;
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            Some((*directive, *effort, rest.trim()))
        } else {
            None
        }
    })
}

/// Applies `/deep` and `/quick` directives.
pub struct PreprocessStage;

#[async_trait]
impl Stage for PreprocessStage {
    fn name(&self) -> &'static str {
        "preprocess"
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
        _services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        let Some((directive, effort, rest)) = parse_directive(&ctx.user_input) else {
            return Ok(StageFlow::Next);
        };
        if rest.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "'{directive}' must be followed by a request"
            )));
        }
        let rest = rest.to_string();

        debug!(request_id = %ctx.id, directive, %effort, "Reasoning directive");
        ctx.metadata.reasoning_level = Some(effort);
        ctx.user_input = rest;
        Ok(StageFlow::Next)
    }
}
