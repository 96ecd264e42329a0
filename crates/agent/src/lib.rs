//! The agent turn machinery for Tidewire.
//!
//! One turn of the [`AgentLoop`]:
//!
//! 1. **Resolve** a model from the turn's reasoning effort
//! 2. **Build** the prompt within the model's token budget
//! 3. **Call** the model, classifying failures as recoverable or terminal
//! 4. **Handle** the response: run tool calls and continue, or finish
//!
//! The loop ends on the first final text or when the turn budget is spent.

pub mod budget;
pub mod caller;
pub mod loop_runner;
pub mod reasoning;
pub mod response;
pub mod token;

pub use budget::{BuiltMessages, ContextProvider, MessageBudgeter, fit_to_budget};
pub use caller::{CallOutcome, LlmCaller};
pub use loop_runner::{AgentLoop, CANCELLED_RESPONSE, EXHAUSTED_RESPONSE, LoopExit, LoopSummary};
pub use reasoning::{EffortClassifier, EffortSource, PatternClassifier, resolve_effort};
pub use response::{BatchPlan, ResponseHandler, TurnOutcome};
