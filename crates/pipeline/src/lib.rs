//! The request pipeline for Tidewire.
//!
//! A request runs through eight stages:
//!
//! 1. **validate**: reject unusable input, load lazy subsystems
//! 2. **inject notifications**: surface finished background work
//! 3. **preprocess**: `/deep` and `/quick` directives
//! 4. **triage**: answer trivial requests without the agent loop
//! 5. **agent loop**: the turn machinery
//! 6. **quality gate**: grade the answer, maybe retry once
//! 7. **postprocess**: strip reasoning blocks
//! 8. **finalize**: record, persist, announce
//!
//! Stages 2–4 and 6 are skipped for a quality-gate retry. A request that
//! triage answers skips straight to postprocess and finalize.

mod completion;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod services;
pub mod stage;
pub mod stages;

pub use engine::{Engine, EngineBuilder, IsolatedRun};
pub use error::PipelineError;
pub use executor::{PipelineExecutor, PipelineOutput};
pub use registry::ServiceRegistry;
pub use services::{NotificationSource, Subsystem, Subsystems};
pub use stage::{RetryPlan, Stage, StageFlow};
pub use stages::{
    Evaluation, LlmQualityEvaluator, LlmTriage, QualityEvaluator, QualityGate, Triage,
    TriageDecision, standard_stages,
};
