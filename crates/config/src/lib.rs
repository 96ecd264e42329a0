//! Configuration loading, validation, and management for tidewire.
//!
//! Loads configuration from `~/.tidewire/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tidewire_core::TaskRole;

/// The root configuration structure.
///
/// Maps directly to `~/.tidewire/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Model used for any role without an explicit entry
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Task role → model mapping
    #[serde(default)]
    pub models: ModelsConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool execution settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Post-hoc quality evaluation
    #[serde(default)]
    pub quality: QualityConfig,

    /// Fast-path triage
    #[serde(default)]
    pub triage: TriageConfig,

    /// Background task manager
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Recurring schedules started with the engine
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("providers", &self.providers)
            .field("models", &self.models)
            .field("agent", &self.agent)
            .field("tools", &self.tools)
            .field("quality", &self.quality)
            .field("triage", &self.triage)
            .field("tasks", &self.tasks)
            .field("schedules", &self.schedules)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .finish()
    }
}

// ── Models ──────────────────────────────────────────────────────────────

/// One configured model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,

    /// Falls back to `default_provider`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    #[serde(default = "default_true")]
    pub supports_tool_calling: bool,

    #[serde(default)]
    pub supports_reasoning_effort: bool,
}

fn default_context_window() -> usize {
    128_000
}
fn default_max_output_tokens() -> usize {
    4096
}

impl ModelEntry {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider: None,
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            supports_tool_calling: true,
            supports_reasoning_effort: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<ModelEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general: Option<ModelEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ModelEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<ModelEntry>,

    /// Role used when the chosen role's model cannot call tools
    #[serde(default = "default_tool_fallback_role")]
    pub tool_fallback_role: TaskRole,
}

fn default_tool_fallback_role() -> TaskRole {
    TaskRole::General
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            fast: None,
            general: None,
            reasoning: None,
            evaluator: None,
            tool_fallback_role: default_tool_fallback_role(),
        }
    }
}

impl ModelsConfig {
    pub fn entry(&self, role: TaskRole) -> Option<&ModelEntry> {
        match role {
            TaskRole::Fast => self.fast.as_ref(),
            TaskRole::General => self.general.as_ref(),
            TaskRole::Reasoning => self.reasoning.as_ref(),
            TaskRole::Evaluator => self.evaluator.as_ref(),
        }
    }
}

// ── Agent ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// How many recent user exchanges are sent to the model
    #[serde(default = "default_history_exchanges")]
    pub history_exchanges: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Tools whose result is authoritative enough to end the request soon after
    #[serde(default)]
    pub direct_answer_tools: Vec<String>,

    /// Extra turns allowed after a direct-answer tool fires
    #[serde(default = "default_direct_answer_grace_turns")]
    pub direct_answer_grace_turns: u32,

    /// Consecutive transport failures tolerated before the loop gives up
    #[serde(default = "default_max_transport_failures")]
    pub max_transport_failures: u32,

    /// Regexes that push a request to high reasoning effort
    #[serde(default = "default_high_effort_patterns")]
    pub high_effort_patterns: Vec<String>,

    /// Regexes that allow low reasoning effort
    #[serde(default = "default_low_effort_patterns")]
    pub low_effort_patterns: Vec<String>,
}

fn default_max_turns() -> u32 {
    25
}
fn default_history_exchanges() -> usize {
    10
}
fn default_system_prompt() -> String {
    "You are a capable assistant working inside the user's workspace. \
     Use the available tools when they help, and answer concisely."
        .into()
}
fn default_direct_answer_grace_turns() -> u32 {
    1
}
fn default_max_transport_failures() -> u32 {
    2
}
fn default_high_effort_patterns() -> Vec<String> {
    vec![
        r"(?i)\b(refactor|architect|design|debug|prove|analy[sz]e|optimi[sz]e)\b".into(),
        r"(?i)\bstep[- ]by[- ]step\b".into(),
        r"(?i)\bwhy (does|doesn't|is|isn't)\b".into(),
    ]
}
fn default_low_effort_patterns() -> Vec<String> {
    vec![
        r"(?i)^\s*(hi|hello|hey|thanks|thank you|ok|okay)\b".into(),
        r"^[\s\d+\-*/().=?]+$".into(),
    ]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            history_exchanges: default_history_exchanges(),
            system_prompt: default_system_prompt(),
            direct_answer_tools: Vec::new(),
            direct_answer_grace_turns: default_direct_answer_grace_turns(),
            max_transport_failures: default_max_transport_failures(),
            high_effort_patterns: default_high_effort_patterns(),
            low_effort_patterns: default_low_effort_patterns(),
        }
    }
}

// ── Tools ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Default for plugin-sourced tools
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,

    /// Per-tool overrides, keyed by tool name
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,

    /// Tools that are always safe to run in parallel
    #[serde(default = "default_read_only_tools")]
    pub read_only_tools: Vec<String>,

    /// How long an out-of-workspace access waits for a decision
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Record mutating tool calls instead of running them
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub validate_writes: bool,

    /// Command run after each write; the written path is appended
    #[serde(default)]
    pub validation_command: Vec<String>,

    /// Paths file tools may never touch
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
}

fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_plugin_timeout_secs() -> u64 {
    120
}
fn default_read_only_tools() -> Vec<String> {
    ["read_file", "list_dir", "check_task", "list_tasks"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_confirmation_timeout_secs() -> u64 {
    60
}
fn default_forbidden_paths() -> Vec<String> {
    ["/etc/shadow", "/etc/sudoers", "~/.ssh", "~/.gnupg", "~/.aws"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_tool_timeout_secs(),
            plugin_timeout_secs: default_plugin_timeout_secs(),
            timeouts: HashMap::new(),
            read_only_tools: default_read_only_tools(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            dry_run: false,
            validate_writes: false,
            validation_command: Vec::new(),
            forbidden_paths: default_forbidden_paths(),
        }
    }
}

// ── Quality & triage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Responses scoring below this (1–10) are retried
    #[serde(default = "default_quality_threshold")]
    pub threshold: u8,
}

fn default_quality_threshold() -> u8 {
    6
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_quality_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Ring buffer capacity per task
    #[serde(default = "default_output_log_lines")]
    pub output_log_lines: usize,

    /// Terminal tasks older than this are evicted by cleanup
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Run `git init` in freshly created workspace directories
    #[serde(default)]
    pub git_init: bool,

    /// Workspace roots may not be these paths or lie beneath them
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// Workspace roots may not be exactly these paths
    #[serde(default = "default_protected_exact_paths")]
    pub protected_exact_paths: Vec<String>,

    /// Subdirectories of the home directory that are off limits
    #[serde(default = "default_sensitive_home_dirs")]
    pub sensitive_home_dirs: Vec<String>,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_output_log_lines() -> usize {
    1000
}
fn default_retention_secs() -> u64 {
    3600
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_protected_paths() -> Vec<String> {
    [
        "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin", "/sys",
        "/usr", "/var/lib", "/var/log", "/var/run", "/System", "/Library", "/private/etc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_protected_exact_paths() -> Vec<String> {
    ["/", "/home", "/Users", "/var", "/tmp", "~"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_sensitive_home_dirs() -> Vec<String> {
    [".ssh", ".gnupg", ".aws", ".config/gcloud", ".kube", ".docker", ".tidewire"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            output_log_lines: default_output_log_lines(),
            retention_secs: default_retention_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            git_init: false,
            protected_paths: default_protected_paths(),
            protected_exact_paths: default_protected_exact_paths(),
            sensitive_home_dirs: default_sensitive_home_dirs(),
        }
    }
}

/// A recurring prompt run as a background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,

    pub interval_secs: u64,

    /// Message sent to the engine on every tick
    pub prompt: String,
}

// ── Loading ─────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.tidewire/config.toml)
    /// with environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        if config.api_key.is_none() {
            config.api_key = std::env::var("TIDEWIRE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("TIDEWIRE_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("TIDEWIRE_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tidewire")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_turns must be at least 1".into(),
            ));
        }

        if !(1..=10).contains(&self.quality.threshold) {
            return Err(ConfigError::ValidationError(
                "quality.threshold must be between 1 and 10".into(),
            ));
        }

        if self.tools.default_timeout_secs == 0 || self.tools.plugin_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tool timeouts must be greater than 0".into(),
            ));
        }

        if self.tasks.max_concurrent == 0 || self.tasks.output_log_lines == 0 {
            return Err(ConfigError::ValidationError(
                "tasks.max_concurrent and tasks.output_log_lines must be greater than 0".into(),
            ));
        }

        if self.tools.validate_writes && self.tools.validation_command.is_empty() {
            return Err(ConfigError::ValidationError(
                "tools.validate_writes requires tools.validation_command".into(),
            ));
        }

        for schedule in &self.schedules {
            if schedule.interval_secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "schedule '{}' must have interval_secs > 0",
                    schedule.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// API key for a provider: the provider's own key, else the global one.
    pub fn api_key_for(&self, provider: &str) -> Option<String> {
        self.providers
            .get(provider)
            .and_then(|p| p.api_key.clone())
            .or_else(|| self.api_key.clone())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            providers: HashMap::new(),
            models: ModelsConfig::default(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            quality: QualityConfig::default(),
            triage: TriageConfig::default(),
            tasks: TasksConfig::default(),
            schedules: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
