//! Workspace tasks: sub-agents running in their own engine, rooted at a
//! different directory.
//!
//! The target path is checked against the workspace deny-list before
//! anything touches the filesystem, and the task record only exists once
//! the directory is ready. The sub-engine's own event bus feeds the task's
//! output log, and the engine is disposed on every exit path.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tidewire_config::AppConfig;
use tidewire_core::error::TaskError;
use tidewire_core::history::{FileHistory, HistoryStore};
use tidewire_core::request::RequestContext;
use tidewire_core::{CancellationToken, DomainEvent, EventBus};
use tidewire_pipeline::Engine;
use tidewire_providers::ModelRouter;
use tidewire_tools::{ConfirmationGate, Decision};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::manager::{BoxError, PromptRunner, TaskContext, TaskHandle, TaskManager, new_task_id};
use crate::record::{TaskKind, TaskRecord, WorkspaceInfo};

/// Conversation file of a workspace task, relative to its root.
pub const WORKSPACE_HISTORY_FILE: &str = ".tidewire/history.json";

/// An isolated engine a workspace task runs on.
#[async_trait]
pub trait SubEngine: Send + Sync {
    /// The engine's own bus. Never the spawning session's.
    fn events(&self) -> Arc<EventBus>;

    /// Run one prompt to completion. `Err` carries the failure message.
    async fn run(&self, prompt: &str, cancel: CancellationToken) -> Result<String, String>;

    /// Close remote servers, shut down subsystems, save the conversation.
    async fn dispose(&self);
}

/// Builds a [`SubEngine`] rooted at a workspace directory.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, workspace: &Path) -> Result<Arc<dyn SubEngine>, TaskError>;
}

#[async_trait]
impl SubEngine for Engine {
    fn events(&self) -> Arc<EventBus> {
        Engine::events(self).clone()
    }

    async fn run(&self, prompt: &str, cancel: CancellationToken) -> Result<String, String> {
        let mut ctx = RequestContext::new(prompt, self.config().agent.max_turns).with_cancel(cancel);
        let output = self.execute(&mut ctx).await;
        if output.failed {
            Err(output.response)
        } else {
            Ok(output.response)
        }
    }

    async fn dispose(&self) {
        Engine::dispose(self).await;
    }
}

#[async_trait]
impl PromptRunner for Engine {
    async fn run_prompt(&self, prompt: &str, cancel: CancellationToken) -> Result<String, String> {
        self.run_isolated(prompt, cancel)
            .await
            .map(|run| run.response)
            .map_err(|e| e.to_string())
    }
}

/// Builds full pipeline engines with a file-backed conversation in the
/// workspace. Sub-engines cannot ask anyone for confirmation, so access
/// outside their root is denied.
pub struct PipelineEngineFactory {
    config: AppConfig,
    router: Option<Arc<ModelRouter>>,
}

impl PipelineEngineFactory {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            router: None,
        }
    }

    /// Share one router between the session and its sub-engines.
    pub fn with_router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }
}

#[async_trait]
impl EngineFactory for PipelineEngineFactory {
    async fn create(&self, workspace: &Path) -> Result<Arc<dyn SubEngine>, TaskError> {
        let history = FileHistory::open(workspace.join(WORKSPACE_HISTORY_FILE))
            .await
            .map_err(|e| TaskError::EngineStart(e.to_string()))?;

        let mut builder = Engine::builder(self.config.clone(), workspace)
            .with_history(Arc::new(history) as Arc<dyn HistoryStore>)
            .with_gate(Arc::new(ConfirmationGate::auto(Decision::Deny)));
        if let Some(router) = &self.router {
            builder = builder.with_router(router.clone());
        }
        let engine = builder
            .build()
            .map_err(|e| TaskError::EngineStart(e.to_string()))?;
        Ok(Arc::new(engine))
    }
}

/// Disposes the sub-engine if the task body is dropped before it could do
/// so itself (cancellation drops the body mid-run).
struct DisposeGuard(Option<Arc<dyn SubEngine>>);

impl DisposeGuard {
    async fn dispose(mut self) {
        if let Some(engine) = self.0.take() {
            engine.dispose().await;
        }
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.0.take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { engine.dispose().await });
        }
    }
}

/// How a spawned workspace task should run.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceTaskOptions {
    pub origin_conversation: Option<String>,
}

impl TaskManager {
    /// Spawn a sub-agent in its own engine rooted at `workspace`.
    ///
    /// Fails before creating a record or directory when the path is on the
    /// deny-list, and before creating a record when the directory cannot be
    /// prepared.
    pub async fn spawn_workspace_task(
        self: &Arc<Self>,
        description: impl Into<String>,
        query: impl Into<String>,
        workspace: &str,
        options: WorkspaceTaskOptions,
    ) -> Result<TaskHandle, TaskError> {
        let path = self
            .policy
            .check(workspace)
            .map_err(|e| TaskError::ForbiddenWorkspace {
                path: workspace.to_string(),
                reason: e.to_string(),
            })?;
        let factory = self
            .engine_factory
            .clone()
            .ok_or_else(|| TaskError::EngineUnavailable("workspace".into()))?;

        let dir_created = prepare_directory(&path, self.config().git_init).await?;

        let mut record = TaskRecord::new(
            new_task_id(),
            description.into(),
            query.into(),
            TaskKind::Workspace,
            self.config().output_log_lines,
        );
        record.workspace = Some(WorkspaceInfo {
            path: path.clone(),
            dir_created,
            origin_workspace: self.origin_workspace.clone(),
            origin_conversation: options.origin_conversation,
        });
        let prompt = record.query.clone();
        info!(task_id = %record.id, workspace = %path.display(), dir_created, "Workspace task accepted");

        Ok(self.launch(record, move |ctx| async move {
            let engine = factory.create(&path).await.map_err(BoxError::from)?;
            let guard = DisposeGuard(Some(engine.clone()));
            ctx.progress(5);

            let mut events = engine.events().subscribe();
            let run = engine.run(&prompt, ctx.cancel.clone());
            tokio::pin!(run);
            let mut events_open = true;
            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    received = events.recv(), if events_open => match received {
                        Ok(event) => forward_event(&ctx, &event),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(task_id = %ctx.id, skipped, "Workspace task output lagged");
                        }
                        Err(RecvError::Closed) => events_open = false,
                    },
                }
            };
            while let Ok(event) = events.try_recv() {
                forward_event(&ctx, &event);
            }
            guard.dispose().await;

            match result {
                Ok(response) => {
                    ctx.log(&response);
                    Ok(response)
                }
                Err(message) => Err(BoxError::from(message)),
            }
        }))
    }
}

/// Create the workspace directory if needed. Returns whether it was
/// created.
async fn prepare_directory(path: &Path, git_init: bool) -> Result<bool, TaskError> {
    let creation_error = |reason: String| TaskError::WorkspaceCreation {
        path: path.display().to_string(),
        reason,
    };

    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Ok(false),
        Ok(_) => return Err(creation_error("exists and is not a directory".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(creation_error(e.to_string())),
    }

    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| creation_error(e.to_string()))?;

    if git_init {
        git_init_quietly(path).await;
    }
    Ok(true)
}

async fn git_init_quietly(path: &Path) {
    let result = tokio::process::Command::new("git")
        .arg("init")
        .arg("--quiet")
        .current_dir(path)
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {
            debug!(workspace = %path.display(), "Initialised git repository");
        }
        Ok(output) => warn!(
            workspace = %path.display(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "git init failed"
        ),
        Err(e) => warn!(workspace = %path.display(), error = %e, "Could not run git"),
    }
}

fn forward_event(ctx: &TaskContext, event: &DomainEvent) {
    if let Some(line) = describe_event(event) {
        ctx.log(line);
    }
    if let DomainEvent::TurnStarted { turn, max_turns, .. } = event
        && *max_turns > 0
    {
        ctx.progress(((turn * 90) / max_turns).min(95) as u8);
    }
}

/// Output-log line for a sub-engine event, if it is worth one.
fn describe_event(event: &DomainEvent) -> Option<String> {
    match event {
        DomainEvent::TurnStarted { turn, max_turns, .. } => Some(format!("turn {turn}/{max_turns}")),
        DomainEvent::ToolExecuted {
            tool_name,
            success,
            duration_ms,
            ..
        } => Some(format!(
            "{tool_name} {} ({duration_ms}ms)",
            if *success { "ok" } else { "failed" }
        )),
        DomainEvent::LlmCallFailed { error_message, .. } => {
            Some(format!("model call failed: {error_message}"))
        }
        DomainEvent::RetryTriggered { score, .. } => {
            Some(format!("retrying after quality score {score}"))
        }
        DomainEvent::RequestCompleted { turns, tool_calls, .. } => Some(format!(
            "finished after {turns} turns and {tool_calls} tool calls"
        )),
        DomainEvent::RequestFailed { error_message, .. } => Some(format!("error: {error_message}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use tidewire_config::TasksConfig;
    use tidewire_security::WorkspacePolicy;

    use crate::record::TaskStatus;

    struct FakeEngine {
        events: Arc<EventBus>,
        reply: Result<String, String>,
        block: bool,
        disposed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SubEngine for FakeEngine {
        fn events(&self) -> Arc<EventBus> {
            self.events.clone()
        }

        async fn run(&self, _prompt: &str, cancel: CancellationToken) -> Result<String, String> {
            self.events.publish(DomainEvent::TurnStarted {
                request_id: "r".into(),
                turn: 1,
                max_turns: 10,
                timestamp: Utc::now(),
            });
            tokio::task::yield_now().await;
            if self.block {
                cancel.cancelled().await;
            }
            self.reply.clone()
        }

        async fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        reply: Result<String, String>,
        block: bool,
        disposed: Arc<AtomicBool>,
        created: AtomicUsize,
    }

    impl FakeFactory {
        fn new(reply: Result<String, String>, block: bool) -> Self {
            Self {
                reply,
                block,
                disposed: Arc::new(AtomicBool::new(false)),
                created: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EngineFactory for FakeFactory {
        async fn create(&self, _workspace: &Path) -> Result<Arc<dyn SubEngine>, TaskError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeEngine {
                events: Arc::new(EventBus::new(32)),
                reply: self.reply.clone(),
                block: self.block,
                disposed: self.disposed.clone(),
            }))
        }
    }

    fn manager(factory: Arc<FakeFactory>, home: &Path) -> Arc<TaskManager> {
        let config = TasksConfig {
            poll_interval_ms: 5,
            ..TasksConfig::default()
        };
        let policy = WorkspacePolicy::from_config(&config).with_home(home);
        Arc::new(
            TaskManager::new(config)
                .with_policy(policy)
                .with_engine_factory(factory),
        )
    }

    #[tokio::test]
    async fn forbidden_roots_fail_before_any_side_effect() {
        let home = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(Ok("x".into()), false));
        let manager = manager(factory.clone(), home.path());

        for root in ["/etc", "/etc/tidewire-task", "~/.ssh", "~/.ssh/new-dir"] {
            let err = manager
                .spawn_workspace_task("t", "q", root, WorkspaceTaskOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, TaskError::ForbiddenWorkspace { .. }), "{root}");
        }
        assert!(manager.list_tasks().is_empty());
        assert!(!home.path().join(".ssh").exists());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn creates_directory_and_streams_sub_engine_output() {
        let home = tempfile::tempdir().unwrap();
        let target = home.path().join("projects/new");
        let factory = Arc::new(FakeFactory::new(Ok("built it".into()), false));
        let manager = manager(factory.clone(), home.path());

        let handle = manager
            .spawn_workspace_task(
                "scaffold",
                "create a crate",
                target.to_str().unwrap(),
                WorkspaceTaskOptions {
                    origin_conversation: Some("conv-1".into()),
                },
            )
            .await
            .unwrap();
        assert!(target.is_dir());

        let record = manager
            .wait_for_task(&handle.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.kind, TaskKind::Workspace);
        let info = record.workspace.as_ref().unwrap();
        assert!(info.dir_created);
        assert_eq!(info.origin_conversation.as_deref(), Some("conv-1"));
        assert!(record.output_log.lines().any(|l| l == "turn 1/10"));
        assert!(record.output_log.lines().any(|l| l == "built it"));
        assert!(factory.disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sub_engine_failure_fails_the_task_and_disposes() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join("ws");
        std::fs::create_dir(&root).unwrap();
        let factory = Arc::new(FakeFactory::new(Err("Error: no provider".into()), false));
        let manager = manager(factory.clone(), home.path());

        let handle = manager
            .spawn_workspace_task("t", "q", root.to_str().unwrap(), WorkspaceTaskOptions::default())
            .await
            .unwrap();
        let record = manager
            .wait_for_task(&handle.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("Error: no provider"));
        assert!(!record.workspace.unwrap().dir_created);
        assert!(factory.disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_still_disposes_the_sub_engine() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join("ws");
        let factory = Arc::new(FakeFactory::new(Ok("never".into()), true));
        let manager = manager(factory.clone(), home.path());

        let handle = manager
            .spawn_workspace_task("t", "q", root.to_str().unwrap(), WorkspaceTaskOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.cancel_task(&handle.id).unwrap();

        for _ in 0..50 {
            if factory.disposed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(factory.disposed.load(Ordering::SeqCst));
        assert_eq!(manager.get_task(&handle.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn home_directory_itself_is_not_a_workspace() {
        let home = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(Ok("x".into()), false));
        let manager = manager(factory.clone(), home.path());

        let err = manager
            .spawn_workspace_task("t", "q", home.path().to_str().unwrap(), WorkspaceTaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ForbiddenWorkspace { .. }), "{err}");
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_file_in_the_way_is_a_creation_error() {
        let home = tempfile::tempdir().unwrap();
        let file = home.path().join("occupied");
        std::fs::write(&file, "x").unwrap();
        let manager = manager(Arc::new(FakeFactory::new(Ok("x".into()), false)), home.path());

        let err = manager
            .spawn_workspace_task("t", "q", file.to_str().unwrap(), WorkspaceTaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::WorkspaceCreation { .. }));
        assert!(manager.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn no_factory_means_no_workspace_tasks() {
        let home = tempfile::tempdir().unwrap();
        let manager = Arc::new(
            TaskManager::new(TasksConfig::default())
                .with_policy(WorkspacePolicy::default().with_home(home.path())),
        );
        let root = home.path().join("ws");
        let err = manager
            .spawn_workspace_task("t", "q", root.to_str().unwrap(), WorkspaceTaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::EngineUnavailable(_)), "{err}");
        assert!(!root.exists());
        assert!(manager.list_tasks().is_empty());
    }
}
