//! The engine: one pipeline, one conversation and one tool executor per
//! workspace.
//!
//! [`EngineBuilder`] wires the collaborators from configuration into the
//! [`ServiceRegistry`]; anything can be swapped before `build()`. A
//! workspace task gets its own engine, so nothing here is shared between
//! workspaces except what the caller passes in explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tidewire_agent::{AgentLoop, LoopSummary};
use tidewire_config::AppConfig;
use tidewire_core::history::{HistoryStore, InMemoryHistory};
use tidewire_core::message::Role;
use tidewire_core::request::RequestContext;
use tidewire_core::tool::ToolSource;
use tidewire_core::{CancellationToken, EventBus};
use tidewire_providers::{ModelRouter, build_from_config};
use tidewire_tools::{
    CommandValidator, ConfirmationGate, ExecutorConfig, ToolExecutor, WriteValidator,
    default_registry,
};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::executor::{PipelineExecutor, PipelineOutput};
use crate::registry::ServiceRegistry;
use crate::services::{NotificationSource, Subsystem, Subsystems};
use crate::stage::Stage;
use crate::stages::{LlmQualityEvaluator, LlmTriage, QualityEvaluator, QualityGate, Triage};

const EVENT_BUS_CAPACITY: usize = 1024;

/// Result of a sub-agent run that bypasses the conversation.
#[derive(Debug, Clone)]
pub struct IsolatedRun {
    pub response: String,
    pub summary: LoopSummary,
}

pub struct EngineBuilder {
    config: AppConfig,
    workspace_root: PathBuf,
    router: Option<Arc<ModelRouter>>,
    history: Option<Arc<dyn HistoryStore>>,
    events: Option<Arc<EventBus>>,
    gate: Option<Arc<ConfirmationGate>>,
    validator: Option<Arc<dyn WriteValidator>>,
    tool_sources: Vec<Arc<dyn ToolSource>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    subsystems: Vec<Arc<dyn Subsystem>>,
    triage: Option<Arc<dyn Triage>>,
    evaluator: Option<Arc<dyn QualityEvaluator>>,
    stages: Option<Vec<Arc<dyn Stage>>>,
    dry_run: Option<bool>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workspace_root: workspace_root.into(),
            router: None,
            history: None,
            events: None,
            gate: None,
            validator: None,
            tool_sources: Vec::new(),
            notifications: None,
            subsystems: Vec::new(),
            triage: None,
            evaluator: None,
            stages: None,
            dry_run: None,
        }
    }

    /// Use this router instead of one built from the config's providers.
    pub fn with_router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_gate(mut self, gate: Arc<ConfirmationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn WriteValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Add a tool source after the built-in tools.
    pub fn with_tool_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.tool_sources.push(source);
        self
    }

    pub fn with_notifications(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(source);
        self
    }

    pub fn with_subsystem(mut self, subsystem: Arc<dyn Subsystem>) -> Self {
        self.subsystems.push(subsystem);
        self
    }

    pub fn with_triage(mut self, triage: Arc<dyn Triage>) -> Self {
        self.triage = Some(triage);
        self
    }

    pub fn with_quality_evaluator(mut self, evaluator: Arc<dyn QualityEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Replace the standard stage list.
    pub fn with_stages(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    pub fn build(self) -> Result<Engine, PipelineError> {
        let config = self.config;
        let root = self.workspace_root;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::new(EVENT_BUS_CAPACITY)));
        let router = self
            .router
            .unwrap_or_else(|| Arc::new(build_from_config(&config)));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistory::new()) as Arc<dyn HistoryStore>);

        // Tools
        let mut executor_config = ExecutorConfig::from_config(&config.tools, &root);
        if let Some(dry_run) = self.dry_run {
            executor_config = executor_config.with_dry_run(dry_run);
        }
        let gate = self.gate.unwrap_or_else(|| {
            Arc::new(
                ConfirmationGate::new(Duration::from_secs(config.tools.confirmation_timeout_secs))
                    .with_events(events.clone()),
            )
        });
        let mut executor = ToolExecutor::new(executor_config)
            .with_source(Arc::new(default_registry(&config.tools.forbidden_paths)))
            .with_gate(gate)
            .with_events(events.clone());
        for source in self.tool_sources {
            executor = executor.with_source(source);
        }
        let validator = self.validator.or_else(|| {
            if !config.tools.validate_writes {
                return None;
            }
            CommandValidator::new(&config.tools.validation_command, &root)
                .map(|v| Arc::new(v) as Arc<dyn WriteValidator>)
        });
        if let Some(validator) = validator {
            executor = executor.with_validator(validator);
        }
        let executor = Arc::new(executor);

        let agent = Arc::new(
            AgentLoop::from_config(&config, router.clone(), executor.clone())?
                .with_events(events.clone()),
        );

        // Triage and quality gate
        let triage = self.triage.or_else(|| {
            config
                .triage
                .enabled
                .then(|| Arc::new(LlmTriage::new(router.clone())) as Arc<dyn Triage>)
        });
        let evaluator = self.evaluator.or_else(|| {
            config
                .quality
                .enabled
                .then(|| Arc::new(LlmQualityEvaluator::new(router.clone())) as Arc<dyn QualityEvaluator>)
        });

        let subsystems = Arc::new(Subsystems::new(self.subsystems));
        let mut services = ServiceRegistry::new()
            .with(history.clone())
            .with(agent.clone())
            .with(executor.clone())
            .with(router.clone())
            .with(events.clone())
            .with(subsystems.clone())
            .with(Arc::new(config.clone()));
        if let Some(notifications) = self.notifications {
            services.insert(notifications);
        }
        if let Some(triage) = triage {
            services.insert(triage);
        }
        if let Some(evaluator) = evaluator {
            services.insert(Arc::new(QualityGate::new(evaluator, config.quality.threshold)));
        }
        let services = Arc::new(services);

        let pipeline = match self.stages {
            Some(stages) => PipelineExecutor::with_stages(services.clone(), stages),
            None => PipelineExecutor::new(services.clone()),
        };

        info!(
            workspace = %root.display(),
            stages = pipeline.stage_names().len(),
            services = services.len(),
            "Engine built"
        );
        Ok(Engine {
            workspace_root: root,
            config,
            services,
            pipeline,
            agent,
            history,
            executor,
            events,
            subsystems,
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }
}

pub struct Engine {
    workspace_root: PathBuf,
    config: AppConfig,
    services: Arc<ServiceRegistry>,
    pipeline: PipelineExecutor,
    agent: Arc<AgentLoop>,
    history: Arc<dyn HistoryStore>,
    executor: Arc<ToolExecutor>,
    events: Arc<EventBus>,
    subsystems: Arc<Subsystems>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl Engine {
    pub fn builder(config: AppConfig, workspace_root: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(config, workspace_root)
    }

    /// A fresh request context. Disposing the engine cancels it.
    pub fn new_request(&self, input: impl Into<String>) -> RequestContext {
        RequestContext::new(input, self.config.agent.max_turns)
            .with_cancel(self.shutdown.child_token())
    }

    /// Run one user message through the pipeline.
    pub async fn handle(&self, input: &str) -> PipelineOutput {
        let mut ctx = self.new_request(input);
        self.pipeline.execute_guarded(&mut ctx).await
    }

    /// Run a caller-built context through the pipeline.
    pub async fn execute(&self, ctx: &mut RequestContext) -> PipelineOutput {
        self.pipeline.execute_guarded(ctx).await
    }

    /// Run `prompt` through the agent loop on a scratch conversation. Used
    /// for sub-agents that share this workspace but must not write into its
    /// conversation.
    pub async fn run_isolated(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<IsolatedRun, PipelineError> {
        let scratch = InMemoryHistory::new();
        scratch.add_message(Role::User, prompt);
        let mut ctx = RequestContext::new(prompt, self.config.agent.max_turns).with_cancel(cancel);
        ctx.metadata.user_turn_recorded = true;

        let summary = self.agent.run(&mut ctx, &scratch).await?;
        Ok(IsolatedRun {
            response: ctx.final_response().unwrap_or_default().to_string(),
            summary,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn pipeline(&self) -> &PipelineExecutor {
        &self.pipeline
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel in-flight requests, close tool sources (remote servers,
    /// plugins), shut down subsystems and persist the conversation. Safe to
    /// call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.executor.shutdown().await;
        self.subsystems.shutdown().await;
        if let Err(e) = self.history.persist().await {
            warn!(workspace = %self.workspace_root.display(), error = %e, "Failed to persist history on dispose");
        }
        info!(workspace = %self.workspace_root.display(), "Engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tidewire_core::ToolCall;
    use tidewire_core::error::ProviderError;
    use tidewire_core::message::Message;
    use tidewire_core::model::ModelConfig;
    use tidewire_providers::{ScriptStep, ScriptedProvider};
    use tidewire_tools::RemoteSource;

    use crate::stages::{Evaluation, TriageDecision};

    fn router(provider: Arc<ScriptedProvider>) -> Arc<ModelRouter> {
        let model = ModelConfig {
            model_id: "general".into(),
            provider: "scripted".into(),
            context_window: 32_000,
            max_output_tokens: 1000,
            supports_tool_calling: true,
            supports_reasoning_effort: false,
        };
        Arc::new(ModelRouter::new(model).with_provider("scripted", provider))
    }

    fn quiet_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.triage.enabled = false;
        config.quality.enabled = false;
        config
    }

    struct Grades(std::sync::Mutex<Vec<u8>>);

    #[async_trait]
    impl QualityEvaluator for Grades {
        async fn evaluate(
            &self,
            _input: &str,
            _response: &str,
            _trail: &[Message],
            _cancel: &CancellationToken,
        ) -> Result<Evaluation, ProviderError> {
            let score = self.0.lock().unwrap().remove(0);
            Ok(Evaluation {
                score,
                issue: "incomplete".into(),
                remedy: "list every file".into(),
            })
        }
    }

    struct AlwaysContinue;

    #[async_trait]
    impl Triage for AlwaysContinue {
        async fn triage(
            &self,
            _input: &str,
            _cancel: &CancellationToken,
        ) -> Result<TriageDecision, ProviderError> {
            Ok(TriageDecision::Continue)
        }
    }

    #[tokio::test]
    async fn handles_a_message_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("Hello there")]));
        let engine = Engine::builder(quiet_config(), dir.path())
            .with_router(router(provider))
            .build()
            .unwrap();

        let out = engine.handle("hi").await;
        assert_eq!(out.response, "Hello there");
        assert_eq!(out.turns, 1);
        let history = engine.history().get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].content, "Hello there");
    }

    #[tokio::test]
    async fn quality_retry_keeps_tool_trail_and_child_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptStep::tool_calls(vec![ToolCall::new(
                "c1",
                "read_file",
                r#"{"path":"a.txt"}"#,
            )]),
            ScriptStep::text("a.txt exists"),
            ScriptStep::text("a.txt contains alpha"),
        ]));
        let engine = Engine::builder(quiet_config(), dir.path())
            .with_router(router(provider.clone()))
            .with_triage(Arc::new(AlwaysContinue))
            .with_quality_evaluator(Arc::new(Grades(std::sync::Mutex::new(vec![2]))))
            .build()
            .unwrap();

        let out = engine.handle("what is in a.txt?").await;
        assert_eq!(out.retries, 1);
        assert_eq!(out.response, "a.txt contains alpha");
        assert_eq!(provider.call_count(), 3);

        let history = engine.history().get_history();
        // user, tool call, tool result, improved prompt, final answer
        assert_eq!(history.len(), 5);
        assert!(history[1].has_tool_calls());
        assert_eq!(history[2].role, Role::Tool);
        assert!(history[3].content.contains("list every file"));
        assert_eq!(history[4].content, "a.txt contains alpha");
        assert!(history.iter().all(|m| m.content != "a.txt exists"));
    }

    #[tokio::test]
    async fn missing_provider_fails_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let model = ModelConfig {
            model_id: "ghost".into(),
            provider: "nowhere".into(),
            context_window: 8000,
            max_output_tokens: 0,
            supports_tool_calling: true,
            supports_reasoning_effort: false,
        };
        let engine = Engine::builder(quiet_config(), dir.path())
            .with_router(Arc::new(ModelRouter::new(model)))
            .build()
            .unwrap();

        let out = engine.handle("hi").await;
        assert!(out.failed);
        assert!(out.response.starts_with("Error:"));
        assert!(out.response.contains("agent_loop"));
        assert_eq!(engine.history().len(), 2);
    }

    #[tokio::test]
    async fn run_isolated_leaves_conversation_alone() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("sub result")]));
        let engine = Engine::builder(quiet_config(), dir.path())
            .with_router(router(provider))
            .build()
            .unwrap();

        let run = engine
            .run_isolated("summarise the repo", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.response, "sub result");
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn dispose_cancels_requests_and_closes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let remote = Arc::new(RemoteSource::new());
        let engine = Engine::builder(quiet_config(), dir.path())
            .with_router(router(provider))
            .with_tool_source(remote)
            .build()
            .unwrap();

        let ctx = engine.new_request("later");
        engine.dispose().await;
        engine.dispose().await;
        assert!(engine.is_disposed());
        assert!(ctx.is_cancelled());
    }
}
