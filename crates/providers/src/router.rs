//! Model router: maps task roles to concrete model configurations and
//! model configurations to the provider that serves them.
//!
//! Resolution is recomputed every turn because the reasoning effort, and so
//! the role, can change from one turn to the next.

use std::collections::HashMap;
use std::sync::Arc;

use tidewire_config::{AppConfig, ModelEntry};
use tidewire_core::model::{ModelConfig, ReasoningEffort, TaskRole};
use tidewire_core::provider::Provider;

use crate::openai_compat::OpenAiCompatProvider;

/// The outcome of resolving a model for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The role actually used (after any tool-support fallback)
    pub role: TaskRole,
    pub config: ModelConfig,
    /// The first-choice role could not call tools
    pub fell_back: bool,
}

/// Routes roles to models and models to providers.
pub struct ModelRouter {
    roles: HashMap<TaskRole, ModelConfig>,
    default_config: ModelConfig,
    tool_fallback_role: TaskRole,
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ModelRouter {
    /// Create a router where every role resolves to `default_config` until
    /// overridden.
    pub fn new(default_config: ModelConfig) -> Self {
        Self {
            roles: HashMap::new(),
            default_config,
            tool_fallback_role: TaskRole::General,
            providers: HashMap::new(),
        }
    }

    pub fn with_role(mut self, role: TaskRole, config: ModelConfig) -> Self {
        self.roles.insert(role, config);
        self
    }

    pub fn with_tool_fallback_role(mut self, role: TaskRole) -> Self {
        self.tool_fallback_role = role;
        self
    }

    /// Register a provider under the name model configs refer to.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn register_provider(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// The model configured for `role`, or the default model.
    pub fn resolve_model(&self, role: TaskRole) -> ModelConfig {
        self.roles
            .get(&role)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Resolve a model for a turn at `effort`. When the turn offers tools and
    /// the chosen role cannot call them, the tool fallback role is used.
    pub fn resolve_for_effort(&self, effort: ReasoningEffort, needs_tools: bool) -> Resolution {
        let role = effort.role();
        let config = self.resolve_model(role);
        if !needs_tools || config.supports_tool_calling || role == self.tool_fallback_role {
            return Resolution {
                role,
                config,
                fell_back: false,
            };
        }

        let fallback = self.resolve_model(self.tool_fallback_role);
        if !fallback.supports_tool_calling {
            tracing::warn!(
                role = %self.tool_fallback_role,
                model = %fallback.model_id,
                "Tool fallback model does not support tool calling either"
            );
        }
        tracing::debug!(
            from = %role,
            to = %self.tool_fallback_role,
            "Model lacks tool support, falling back"
        );
        Resolution {
            role: self.tool_fallback_role,
            config: fallback,
            fell_back: true,
        }
    }

    /// Apply an explicit model id on top of a resolved config.
    pub fn with_model_override(config: ModelConfig, model_id: Option<&str>) -> ModelConfig {
        match model_id {
            Some(id) => ModelConfig {
                model_id: id.to_string(),
                ..config
            },
            None => config,
        }
    }

    /// The provider serving `config`.
    pub fn provider_for(&self, config: &ModelConfig) -> Option<Arc<dyn Provider>> {
        self.providers.get(&config.provider).cloned()
    }

    /// List all registered provider names.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

fn model_config(entry: &ModelEntry, default_provider: &str) -> ModelConfig {
    ModelConfig {
        model_id: entry.model_id.clone(),
        provider: entry
            .provider
            .clone()
            .unwrap_or_else(|| default_provider.to_string()),
        context_window: entry.context_window,
        max_output_tokens: entry.max_output_tokens,
        supports_tool_calling: entry.supports_tool_calling,
        supports_reasoning_effort: entry.supports_reasoning_effort,
    }
}

/// Build the router (roles and providers) from configuration.
pub fn build_from_config(config: &AppConfig) -> ModelRouter {
    let default_config = model_config(
        &ModelEntry::new(config.default_model.clone()),
        &config.default_provider,
    );
    let mut router = ModelRouter::new(default_config)
        .with_tool_fallback_role(config.models.tool_fallback_role);

    for role in TaskRole::ALL {
        if let Some(entry) = config.models.entry(role) {
            router = router.with_role(role, model_config(entry, &config.default_provider));
        }
    }

    for (name, provider_config) in &config.providers {
        let api_key = config.api_key_for(name).unwrap_or_default();
        let base_url = provider_config
            .api_url
            .clone()
            .unwrap_or_else(|| default_base_url(name));
        router.register_provider(
            name.clone(),
            Arc::new(OpenAiCompatProvider::new(name, &base_url, &api_key)),
        );
    }

    // Every provider a model refers to gets an endpoint, even if unconfigured
    let mut referenced: Vec<String> = TaskRole::ALL
        .iter()
        .map(|role| router.resolve_model(*role).provider)
        .collect();
    referenced.sort();
    referenced.dedup();
    for name in referenced {
        if !router.providers.contains_key(&name) {
            let api_key = config.api_key_for(&name).unwrap_or_default();
            let base_url = default_base_url(&name);
            router.register_provider(
                name.clone(),
                Arc::new(OpenAiCompatProvider::new(&name, &base_url, &api_key)),
            );
        }
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedProvider;

    fn model(id: &str, tools: bool) -> ModelConfig {
        ModelConfig {
            model_id: id.into(),
            provider: "scripted".into(),
            context_window: 8000,
            max_output_tokens: 1000,
            supports_tool_calling: tools,
            supports_reasoning_effort: false,
        }
    }

    #[test]
    fn unconfigured_roles_use_default() {
        let router = ModelRouter::new(model("default", true));
        assert_eq!(router.resolve_model(TaskRole::Evaluator).model_id, "default");
    }

    #[test]
    fn effort_picks_role() {
        let router = ModelRouter::new(model("default", true))
            .with_role(TaskRole::Fast, model("fast", true))
            .with_role(TaskRole::Reasoning, model("deep", true));
        let r = router.resolve_for_effort(ReasoningEffort::Low, true);
        assert_eq!(r.role, TaskRole::Fast);
        assert_eq!(r.config.model_id, "fast");
        let r = router.resolve_for_effort(ReasoningEffort::High, true);
        assert_eq!(r.config.model_id, "deep");
        assert!(!r.fell_back);
    }

    #[test]
    fn falls_back_when_role_cannot_call_tools() {
        let router = ModelRouter::new(model("default", true))
            .with_role(TaskRole::Reasoning, model("thinker", false))
            .with_role(TaskRole::General, model("worker", true));

        let r = router.resolve_for_effort(ReasoningEffort::High, true);
        assert!(r.fell_back);
        assert_eq!(r.role, TaskRole::General);
        assert_eq!(r.config.model_id, "worker");

        // No tools offered: keep the reasoning model
        let r = router.resolve_for_effort(ReasoningEffort::High, false);
        assert_eq!(r.config.model_id, "thinker");
    }

    #[test]
    fn model_override_replaces_id_only() {
        let cfg = ModelRouter::with_model_override(model("a", true), Some("b"));
        assert_eq!(cfg.model_id, "b");
        assert_eq!(cfg.context_window, 8000);
    }

    #[test]
    fn provider_lookup_by_config() {
        let router = ModelRouter::new(model("default", true))
            .with_provider("scripted", Arc::new(ScriptedProvider::new(vec![])));
        assert!(router.provider_for(&model("x", true)).is_some());
        let mut other = model("x", true);
        other.provider = "missing".into();
        assert!(router.provider_for(&other).is_none());
    }

    #[test]
    fn build_from_default_config() {
        let config = AppConfig::default();
        let router = build_from_config(&config);
        let general = router.resolve_model(TaskRole::General);
        assert_eq!(general.provider, "openrouter");
        assert!(router.provider_for(&general).is_some());
    }

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openrouter").contains("openrouter.ai"));
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("ollama").contains("localhost:11434"));
    }
}
