//! Task manager: owns every task record and drives task bodies.
//!
//! A task body is any future producing `Result<String, BoxError>`. The
//! manager races it against the task's cancellation token, catches panics,
//! and records the outcome. Callers never see a task's failure as an error
//! of their own: they poll [`TaskManager::get_task`], wait with
//! [`TaskManager::wait_for_task`], or follow the per-task update channel
//! returned by every spawn.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tidewire_config::TasksConfig;
use tidewire_core::error::TaskError;
use tidewire_core::{CancellationToken, DomainEvent, EventBus};
use tidewire_pipeline::NotificationSource;
use tidewire_security::WorkspacePolicy;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};

use crate::record::{TaskKind, TaskRecord, TaskStatus};
use crate::schedule::ScheduleEntry;
use crate::workspace::EngineFactory;

/// Error type task bodies return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Something a task's subscribers can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Status(TaskStatus),
    Progress(u8),
    Output(String),
}

/// Returned by every spawn. Dropping `updates` is fine; the task keeps
/// running.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: String,
    pub updates: broadcast::Receiver<TaskUpdate>,
}

/// Runs a prompt on the spawning engine without touching its conversation.
#[async_trait]
pub trait PromptRunner: Send + Sync {
    async fn run_prompt(&self, prompt: &str, cancel: CancellationToken) -> Result<String, String>;
}

/// Handed to a task body.
#[derive(Clone)]
pub struct TaskContext {
    pub id: String,
    pub cancel: CancellationToken,
    manager: Weak<TaskManager>,
}

impl TaskContext {
    /// Append to the task's output log.
    pub fn log(&self, text: impl AsRef<str>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.append_output(&self.id, text.as_ref());
        }
    }

    /// Report progress, clamped to 100.
    pub fn progress(&self, percent: u8) {
        if let Some(manager) = self.manager.upgrade() {
            manager.set_progress(&self.id, percent);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancellationToken,
    updates: broadcast::Sender<TaskUpdate>,
}

enum Outcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

pub struct TaskManager {
    config: TasksConfig,
    tasks: RwLock<HashMap<String, TaskEntry>>,
    permits: Arc<Semaphore>,
    pub(crate) policy: WorkspacePolicy,
    pub(crate) engine_factory: Option<Arc<dyn EngineFactory>>,
    prompt_runner: RwLock<Option<Weak<dyn PromptRunner>>>,
    events: Option<Arc<EventBus>>,
    pub(crate) origin_workspace: Option<PathBuf>,
    pub(crate) schedules: RwLock<HashMap<String, ScheduleEntry>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(config: TasksConfig) -> Self {
        let policy = WorkspacePolicy::from_config(&config);
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            permits,
            policy,
            engine_factory: None,
            prompt_runner: RwLock::new(None),
            events: None,
            origin_workspace: None,
            schedules: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: WorkspacePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Needed for workspace tasks.
    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    /// Mirror task updates onto a session bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// The workspace of the session that owns this manager.
    pub fn with_origin_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.origin_workspace = Some(path.into());
        self
    }

    /// Set the engine used by prompt tasks and schedules. Held weakly: the
    /// engine usually owns this manager through its tools.
    pub fn set_prompt_runner(&self, runner: Weak<dyn PromptRunner>) {
        *self.prompt_runner.write().unwrap_or_else(|e| e.into_inner()) = Some(runner);
    }

    pub fn config(&self) -> &TasksConfig {
        &self.config
    }

    // ── Spawning ────────────────────────────────────────────────────────

    /// Spawn an in-process task running `handler`.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        description: impl Into<String>,
        query: impl Into<String>,
        handler: F,
    ) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
    {
        let record = TaskRecord::new(
            new_task_id(),
            description.into(),
            query.into(),
            TaskKind::InProcess,
            self.config.output_log_lines,
        );
        self.launch(record, handler)
    }

    /// Spawn a task that runs `prompt` through the agent loop of the
    /// registered prompt runner.
    pub fn spawn_prompt(
        self: &Arc<Self>,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<TaskHandle, TaskError> {
        let runner = self
            .prompt_runner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TaskError::EngineUnavailable("in-process".into()))?;
        let prompt = prompt.into();
        let query = prompt.clone();

        Ok(self.spawn(description, query, move |ctx| async move {
            ctx.log(format!("Running: {}", first_line(&prompt)));
            let response = runner
                .run_prompt(&prompt, ctx.cancel.clone())
                .await
                .map_err(BoxError::from)?;
            ctx.log(&response);
            Ok(response)
        }))
    }

    /// Register `record` and start driving `handler` on the runtime.
    pub(crate) fn launch<F, Fut>(self: &Arc<Self>, record: TaskRecord, handler: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
    {
        let id = record.id.clone();
        let cancel = self.shutdown.child_token();
        let (sender, updates) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        info!(task_id = %id, kind = ?record.kind, description = %record.description, "Task queued");
        self.tasks.write().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            TaskEntry {
                record,
                cancel: cancel.clone(),
                updates: sender,
            },
        );
        self.publish(DomainEvent::TaskStatusChanged {
            task_id: id.clone(),
            status: TaskStatus::Queued.to_string(),
            timestamp: Utc::now(),
        });

        let ctx = TaskContext {
            id: id.clone(),
            cancel: cancel.clone(),
            manager: Arc::downgrade(self),
        };
        let work = async move { handler(ctx).await };
        tokio::spawn(self.clone().drive(id.clone(), cancel, work));

        TaskHandle { id, updates }
    }

    async fn drive<Fut>(self: Arc<Self>, id: String, cancel: CancellationToken, work: Fut)
    where
        Fut: Future<Output = Result<String, BoxError>> + Send,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.finish(&id, Outcome::Cancelled);
                return;
            }
            permit = self.permits.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            self.finish(&id, Outcome::Failed("task manager is closed".into()));
            return;
        };
        if self.transition(&id, TaskStatus::Running).is_err() {
            // Cancelled while waiting for a permit
            return;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = AssertUnwindSafe(work).catch_unwind() => match result {
                Ok(Ok(output)) => Outcome::Completed(output),
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(panic) => Outcome::Failed(panic_message(panic.as_ref())),
            },
        };
        self.finish(&id, outcome);
    }

    // ── State changes ───────────────────────────────────────────────────

    fn transition(&self, id: &str, next: TaskStatus) -> Result<(), TaskError> {
        self.update(id, next, |_| {})
    }

    fn update(
        &self,
        id: &str,
        next: TaskStatus,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> Result<(), TaskError> {
        {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
            let current = entry.record.status;
            if !current.can_transition_to(next) {
                return Err(TaskError::InvalidTransition {
                    id: id.to_string(),
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            let record = &mut entry.record;
            record.status = next;
            let now = Utc::now();
            if next == TaskStatus::Running {
                record.started_at = Some(now);
            }
            if next.is_terminal() {
                record.completed_at = Some(now);
            }
            apply(record);
            let _ = entry.updates.send(TaskUpdate::Status(next));
        }

        debug!(task_id = %id, status = %next, "Task status changed");
        self.publish(DomainEvent::TaskStatusChanged {
            task_id: id.to_string(),
            status: next.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn finish(&self, id: &str, outcome: Outcome) {
        let result = match outcome {
            Outcome::Completed(output) => self.update(id, TaskStatus::Completed, |record| {
                record.result = Some(output);
                record.progress = 100;
            }),
            Outcome::Failed(error) => {
                warn!(task_id = %id, error = %error, "Task failed");
                self.update(id, TaskStatus::Failed, |record| record.error = Some(error))
            }
            Outcome::Cancelled => self.transition(id, TaskStatus::Cancelled),
        };
        match result {
            Ok(()) => info!(task_id = %id, "Task finished"),
            // Already cancelled through cancel_task, or evicted
            Err(e) => debug!(task_id = %id, error = %e, "Task outcome discarded"),
        }
    }

    pub(crate) fn append_output(&self, id: &str, text: &str) {
        {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = tasks.get_mut(id) else {
                return;
            };
            entry.record.output_log.push(text);
            for line in text.lines() {
                let _ = entry.updates.send(TaskUpdate::Output(line.to_string()));
            }
        }
        for line in text.lines() {
            self.publish(DomainEvent::TaskOutput {
                task_id: id.to_string(),
                line: line.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    pub(crate) fn set_progress(&self, id: &str, percent: u8) {
        let percent = percent.min(100);
        {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = tasks.get_mut(id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }
            entry.record.progress = percent;
            let _ = entry.updates.send(TaskUpdate::Progress(percent));
        }
        self.publish(DomainEvent::TaskProgress {
            task_id: id.to_string(),
            progress: percent,
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    // ── Queries and control ─────────────────────────────────────────────

    /// Cancel a queued or running task. The record turns `cancelled`
    /// immediately; the body observes its token.
    pub fn cancel_task(&self, id: &str) -> Result<(), TaskError> {
        self.transition(id, TaskStatus::Cancelled)?;
        if let Some(entry) = self.tasks.read().unwrap_or_else(|e| e.into_inner()).get(id) {
            entry.cancel.cancel();
        }
        info!(task_id = %id, "Task cancelled");
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Option<TaskRecord> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.record.clone())
    }

    /// Every task, oldest first.
    pub fn list_tasks(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Subscribe to a task's updates after spawning.
    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<TaskUpdate>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.updates.subscribe())
    }

    pub fn mark_read(&self, id: &str) -> Result<(), TaskError> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        entry.record.read = true;
        Ok(())
    }

    /// Poll until the task reaches a terminal state. A timeout is reported
    /// as [`TaskError::WaitTimeout`], distinct from the task failing.
    pub async fn wait_for_task(&self, id: &str, timeout: Duration) -> Result<TaskRecord, TaskError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let started = tokio::time::Instant::now();
        loop {
            let record = self
                .get_task(id)
                .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(TaskError::WaitTimeout {
                    id: id.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll.min(timeout - waited)).await;
        }
    }

    /// Evict terminal tasks older than the configured retention window.
    pub fn cleanup_old(&self) -> usize {
        self.cleanup_older_than(Duration::from_secs(self.config.retention_secs))
    }

    /// Evict terminal tasks that finished more than `age` ago.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let Some(cutoff) = chrono::TimeDelta::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let record = &entry.record;
            !(record.status.is_terminal() && record.completed_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "Evicted old tasks");
        }
        removed
    }

    /// Tasks that are neither finished nor cancelled.
    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| !entry.record.status.is_terminal())
            .count()
    }

    /// Cancel every task and schedule.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_all_schedules();
        let ids: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, entry)| !entry.record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let _ = self.transition(&id, TaskStatus::Cancelled);
        }
    }
}

/// Finished tasks the user has not heard about, marked read as they are
/// taken.
#[async_trait]
impl NotificationSource for TaskManager {
    async fn take_unread(&self) -> Vec<String> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let mut unread: Vec<&mut TaskRecord> = tasks
            .values_mut()
            .map(|entry| &mut entry.record)
            .filter(|record| record.status.is_terminal() && !record.read)
            .collect();
        unread.sort_by_key(|record| record.completed_at);
        unread
            .into_iter()
            .map(|record| {
                record.read = true;
                notification(record)
            })
            .collect()
    }
}

fn notification(record: &TaskRecord) -> String {
    match record.status {
        TaskStatus::Completed => format!(
            "Task '{}' completed: {}",
            record.description,
            record.result.as_deref().unwrap_or("(no output)")
        ),
        TaskStatus::Failed => format!(
            "Task '{}' failed: {}",
            record.description,
            record.error.as_deref().unwrap_or("unknown error")
        ),
        _ => format!("Task '{}' was cancelled", record.description),
    }
}

pub(crate) fn new_task_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("task_{}", &id[..12])
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("task panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TaskManager> {
        let config = TasksConfig {
            poll_interval_ms: 5,
            ..TasksConfig::default()
        };
        Arc::new(TaskManager::new(config))
    }

    #[tokio::test]
    async fn completed_task_records_result() {
        let manager = manager();
        let handle = manager.spawn("count", "count files", |ctx| async move {
            ctx.log("scanning");
            ctx.progress(50);
            Ok("3 files".to_string())
        });

        let record = manager
            .wait_for_task(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("3 files"));
        assert_eq!(record.progress, 100);
        assert!(record.started_at.is_some() && record.completed_at.is_some());
        assert_eq!(record.output_log.lines().collect::<Vec<_>>(), ["scanning"]);
    }

    #[tokio::test]
    async fn failing_handler_is_captured_with_prior_output() {
        let manager = manager();
        let handle = manager.spawn("flaky", "q", |ctx| async move {
            ctx.log("step one done");
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<String, BoxError>("disk full".into())
        });

        let record = manager
            .wait_for_task(&handle.id, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("disk full"));
        assert_eq!(record.output_log.tail(1), vec!["step one done".to_string()]);
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_task() {
        let manager = manager();
        let handle = manager.spawn("boom", "q", |_ctx| async move {
            if true {
                panic!("bad state");
            }
            Ok(String::new())
        });

        let record = manager
            .wait_for_task(&handle.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("bad state"));
    }

    #[tokio::test]
    async fn cancel_is_immediate_and_final() {
        let manager = manager();
        let handle = manager.spawn("slow", "q", |ctx| async move {
            ctx.cancel.cancelled().await;
            Ok("ignored".to_string())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.cancel_task(&handle.id).unwrap();
        assert_eq!(manager.get_task(&handle.id).unwrap().status, TaskStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = manager.get_task(&handle.id).unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.result.is_none());

        let err = manager.cancel_task(&handle.id).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_distinctly() {
        let manager = manager();
        let handle = manager.spawn("forever", "q", |ctx| async move {
            ctx.cancel.cancelled().await;
            Ok(String::new())
        });

        let err = manager
            .wait_for_task(&handle.id, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::WaitTimeout { .. }));
        assert_eq!(manager.get_task(&handle.id).unwrap().status, TaskStatus::Running);

        let missing = manager.wait_for_task("nope", Duration::from_millis(10)).await;
        assert!(matches!(missing, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn updates_stream_status_progress_and_output() {
        let manager = manager();
        let mut handle = manager.spawn("stream", "q", |ctx| async move {
            ctx.progress(150);
            ctx.log("a\nb");
            Ok("done".to_string())
        });

        let mut seen = Vec::new();
        while let Ok(update) = handle.updates.recv().await {
            let last = matches!(update, TaskUpdate::Status(s) if s.is_terminal());
            seen.push(update);
            if last {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                TaskUpdate::Status(TaskStatus::Running),
                TaskUpdate::Progress(100),
                TaskUpdate::Output("a".into()),
                TaskUpdate::Output("b".into()),
                TaskUpdate::Status(TaskStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let config = TasksConfig {
            max_concurrent: 1,
            poll_interval_ms: 5,
            ..TasksConfig::default()
        };
        let manager = Arc::new(TaskManager::new(config));
        let first = manager.spawn("first", "q", |ctx| async move {
            ctx.cancel.cancelled().await;
            Ok(String::new())
        });
        let second = manager.spawn("second", "q", |_ctx| async move { Ok("ran".to_string()) });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.get_task(&second.id).unwrap().status, TaskStatus::Queued);

        manager.cancel_task(&first.id).unwrap();
        let record = manager
            .wait_for_task(&second.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(record.result.as_deref(), Some("ran"));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_finished_tasks() {
        let manager = manager();
        let done = manager.spawn("done", "q", |_ctx| async move { Ok(String::new()) });
        let running = manager.spawn("running", "q", |ctx| async move {
            ctx.cancel.cancelled().await;
            Ok(String::new())
        });
        manager
            .wait_for_task(&done.id, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(manager.cleanup_old(), 0);
        assert_eq!(manager.cleanup_older_than(Duration::ZERO), 1);
        assert!(manager.get_task(&done.id).is_none());
        assert!(manager.get_task(&running.id).is_some());
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn notifications_are_delivered_once() {
        let manager = manager();
        let ok = manager.spawn("lint", "q", |_ctx| async move { Ok("clean".to_string()) });
        let bad = manager.spawn("build", "q", |_ctx| async move {
            Err::<String, BoxError>("linker error".into())
        });
        manager.wait_for_task(&ok.id, Duration::from_secs(1)).await.unwrap();
        manager.wait_for_task(&bad.id, Duration::from_secs(1)).await.unwrap();

        let notes = manager.take_unread().await;
        assert_eq!(notes.len(), 2);
        assert!(notes.contains(&"Task 'lint' completed: clean".to_string()));
        assert!(notes.contains(&"Task 'build' failed: linker error".to_string()));
        assert!(manager.take_unread().await.is_empty());
        assert!(manager.get_task(&ok.id).unwrap().read);
    }

    #[tokio::test]
    async fn updates_are_mirrored_to_the_session_bus() {
        let events = Arc::new(EventBus::new(64));
        let mut rx = events.subscribe();
        let manager = Arc::new(TaskManager::new(TasksConfig::default()).with_events(events));
        let handle = manager.spawn("mirror", "q", |ctx| async move {
            ctx.log("hello");
            Ok(String::new())
        });
        manager
            .wait_for_task(&handle.id, Duration::from_secs(1))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&"task_status_changed"));
        assert!(kinds.contains(&"task_output"));
    }

    struct Echo;

    #[async_trait]
    impl PromptRunner for Echo {
        async fn run_prompt(&self, prompt: &str, _cancel: CancellationToken) -> Result<String, String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    #[tokio::test]
    async fn prompt_tasks_need_a_runner() {
        let manager = manager();
        assert!(matches!(
            manager.spawn_prompt("p", "hi"),
            Err(TaskError::EngineUnavailable(_))
        ));

        let runner: Arc<dyn PromptRunner> = Arc::new(Echo);
        manager.set_prompt_runner(Arc::downgrade(&runner));
        let handle = manager.spawn_prompt("p", "hi").unwrap();
        let record = manager
            .wait_for_task(&handle.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(record.result.as_deref(), Some("echo: hi"));
        assert_eq!(record.query, "hi");
    }

    #[tokio::test]
    async fn shutdown_cancels_running_tasks() {
        let manager = manager();
        let handle = manager.spawn("long", "q", |ctx| async move {
            ctx.cancel.cancelled().await;
            Ok(String::new())
        });
        manager.shutdown();
        assert_eq!(manager.get_task(&handle.id).unwrap().status, TaskStatus::Cancelled);
    }
}
