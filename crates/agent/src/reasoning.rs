//! Reasoning-effort selection.
//!
//! The effort for a turn comes from, in order of precedence: an explicit
//! override on the request, the request's own situation (a retry, repeated
//! errors, queued user messages), and finally a content classifier. The
//! classifier is pluggable; [`PatternClassifier`] scores the input against
//! configurable regex lists.

use regex_lite::Regex;
use tidewire_config::AgentConfig;
use tidewire_core::model::ReasoningEffort;
use tidewire_core::request::RequestContext;

/// Recorded errors at which a request is escalated to high effort.
const ERROR_ESCALATION_THRESHOLD: usize = 2;

/// Maps request text to an effort level.
pub trait EffortClassifier: Send + Sync {
    fn classify(&self, input: &str) -> ReasoningEffort;
}

/// Where a turn's effort came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffortSource {
    Override,
    Situation,
    Content,
}

/// Regex-list classifier. High patterns win over low ones; no match is medium.
pub struct PatternClassifier {
    high: Vec<Regex>,
    low: Vec<Regex>,
}

impl PatternClassifier {
    pub fn new(high: &[String], low: &[String]) -> Result<Self, regex_lite::Error> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, regex_lite::Error> {
            patterns.iter().map(|p| Regex::new(p)).collect()
        };
        Ok(Self {
            high: compile(high)?,
            low: compile(low)?,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, regex_lite::Error> {
        Self::new(&config.high_effort_patterns, &config.low_effort_patterns)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        let config = AgentConfig::default();
        Self::from_config(&config).unwrap_or(Self {
            high: Vec::new(),
            low: Vec::new(),
        })
    }
}

impl EffortClassifier for PatternClassifier {
    fn classify(&self, input: &str) -> ReasoningEffort {
        if self.high.iter().any(|re| re.is_match(input)) {
            ReasoningEffort::High
        } else if self.low.iter().any(|re| re.is_match(input)) {
            ReasoningEffort::Low
        } else {
            ReasoningEffort::Medium
        }
    }
}

/// Pick the effort for the next turn of `ctx`.
pub fn resolve_effort(
    ctx: &RequestContext,
    classifier: &dyn EffortClassifier,
) -> (ReasoningEffort, EffortSource) {
    if let Some(level) = ctx.metadata.reasoning_level {
        return (level, EffortSource::Override);
    }
    if ctx.is_retry || ctx.errors.len() >= ERROR_ESCALATION_THRESHOLD {
        return (ReasoningEffort::High, EffortSource::Situation);
    }
    let effort = classifier.classify(&ctx.user_input);
    // Queued user messages mean the request is no longer trivial
    if effort == ReasoningEffort::Low && !ctx.metadata.chime_in.is_empty() {
        return (ReasoningEffort::Medium, EffortSource::Situation);
    }
    (effort, EffortSource::Content)
}
