//! Model selection types: reasoning effort, task roles, resolved model configs.

use serde::{Deserialize, Serialize};

/// How much reasoning a turn needs. A fixed small enum so classifiers have a
/// testable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// The task role a turn of this effort is routed to.
    pub fn role(&self) -> TaskRole {
        match self {
            Self::Low => TaskRole::Fast,
            Self::Medium => TaskRole::General,
            Self::High => TaskRole::Reasoning,
        }
    }
}

impl std::fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The job a model is being asked to do. Each role maps to one configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    /// Cheap, quick answers (triage, low-effort turns)
    Fast,
    /// Default agent turns
    General,
    /// Deep reasoning turns
    Reasoning,
    /// Grading responses for the quality gate
    Evaluator,
}

impl TaskRole {
    pub const ALL: [TaskRole; 4] = [Self::Fast, Self::General, Self::Reasoning, Self::Evaluator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::General => "general",
            Self::Reasoning => "reasoning",
            Self::Evaluator => "evaluator",
        }
    }
}

impl std::fmt::Display for TaskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete model resolved for one turn. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub provider: String,
    pub context_window: usize,
    pub max_output_tokens: usize,
    pub supports_tool_calling: bool,
    pub supports_reasoning_effort: bool,
}

impl ModelConfig {
    /// Tokens available for the prompt once the output reservation is taken out.
    pub fn prompt_budget(&self) -> usize {
        self.context_window.saturating_sub(self.max_output_tokens)
    }
}
