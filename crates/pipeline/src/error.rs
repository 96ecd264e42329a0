//! Pipeline errors.
//!
//! Only structural problems surface here: a missing collaborator, input the
//! pipeline cannot work with, or a stage hitting an internal error. Model and
//! tool failures never reach this type; they end up in the final response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Required service not registered: {0}")]
    MissingService(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: tidewire_core::Error,
    },

    #[error(transparent)]
    Provider(#[from] tidewire_core::ProviderError),

    #[error(transparent)]
    Core(#[from] tidewire_core::Error),
}

impl PipelineError {
    /// Attribute a bare core error to the stage it escaped from.
    pub(crate) fn in_stage(self, stage: &'static str) -> Self {
        match self {
            Self::Core(source) => Self::Stage { stage, source },
            Self::Provider(e) => Self::Stage {
                stage,
                source: e.into(),
            },
            other => other,
        }
    }
}
