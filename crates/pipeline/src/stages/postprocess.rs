use async_trait::async_trait;
use tidewire_core::request::RequestContext;

use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::stage::{Stage, StageFlow};

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

/// Remove `<think>…</think>` blocks some models emit before their answer.
/// An unterminated block runs to the end of the text. If nothing is left,
/// the original text is kept.
pub fn strip_reasoning_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        rest = match after_open.find(CLOSE) {
            Some(end) => &after_open[end + CLOSE.len()..],
            None => "",
        };
    }
    out.push_str(rest);

    let stripped = out.trim();
    if stripped.is_empty() {
        text.trim().to_string()
    } else {
        stripped.to_string()
    }
}

/// Cleans the final response before it is recorded.
pub struct PostprocessStage;

#[async_trait]
impl Stage for PostprocessStage {
    fn name(&self) -> &'static str {
        "postprocess"
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        _services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        ctx.rewrite_final_response(|response| strip_reasoning_blocks(&response));
        Ok(StageFlow::Next)
    }
}
