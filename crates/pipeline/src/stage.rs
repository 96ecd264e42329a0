//! The stage contract.
//!
//! A stage reads and writes the [`RequestContext`], looks up collaborators in
//! the [`ServiceRegistry`], and tells the driver how to continue. Stages do
//! not call each other; the [`PipelineExecutor`](crate::PipelineExecutor)
//! walks the list.

use async_trait::async_trait;
use tidewire_core::message::Message;
use tidewire_core::request::RequestContext;

use crate::error::PipelineError;
use crate::registry::ServiceRegistry;

/// How the driver proceeds after a stage.
#[derive(Debug)]
pub enum StageFlow {
    /// Run the next stage.
    Next,
    /// Abandon the remaining stages and re-run the pipeline with a child
    /// context built from this plan.
    Retry(RetryPlan),
}

/// Everything a quality-gate retry needs.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    /// Becomes the child's `user_input`
    pub improved_prompt: String,
    /// The conversation the child starts from, tool trail included
    pub preserved_history: Vec<Message>,
    /// The score that triggered the retry
    pub score: u8,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this stage runs for a quality-gate retry child.
    fn runs_on_retry(&self) -> bool {
        true
    }

    /// Whether this stage is bypassed once a request is marked
    /// `skip_to_finalize`.
    fn skipped_on_fast_path(&self) -> bool {
        false
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError>;
}
