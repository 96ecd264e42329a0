//! Tools that let the model start and inspect background tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::error::ToolError;
use tidewire_core::tool::{SourceKind, ToolContext, ToolHandler, ToolOutput, ToolRegistry};

use crate::manager::TaskManager;
use crate::record::TaskRecord;
use crate::workspace::WorkspaceTaskOptions;

/// Output lines included in a `check_task` reply.
const CHECK_TAIL_LINES: usize = 20;

/// A custom-source registry holding the four task tools.
pub fn task_tools(manager: Arc<TaskManager>) -> ToolRegistry {
    let registry = ToolRegistry::new(SourceKind::Custom);
    registry.register(Arc::new(SpawnTaskTool::new(manager.clone())));
    registry.register(Arc::new(CheckTaskTool::new(manager.clone())));
    registry.register(Arc::new(CancelTaskTool::new(manager.clone())));
    registry.register(Arc::new(ListTasksTool::new(manager)));
    registry
}

fn required_str<'a>(arguments: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

fn failed(tool_name: &str, reason: impl ToString) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool_name.into(),
        reason: reason.to_string(),
    }
}

// ── spawn_background_task ───────────────────────────────────────────────

pub struct SpawnTaskTool {
    manager: Arc<TaskManager>,
}

impl SpawnTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for SpawnTaskTool {
    fn name(&self) -> &str {
        "spawn_background_task"
    }

    fn description(&self) -> &str {
        "Start a sub-agent in the background and return its task id immediately. \
         Give `workspace` (an absolute path) to run it in its own isolated workspace; \
         otherwise it runs in the current one. Use check_task to follow it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Short label shown in task listings"
                },
                "prompt": {
                    "type": "string",
                    "description": "Complete instructions for the sub-agent"
                },
                "workspace": {
                    "type": "string",
                    "description": "Absolute directory to run in; created if missing"
                }
            },
            "required": ["description", "prompt"]
        })
    }

    fn mutates(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let description = required_str(&arguments, "description")?;
        let prompt = required_str(&arguments, "prompt")?;
        let workspace = arguments
            .get("workspace")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let handle = match workspace {
            Some(root) => self
                .manager
                .spawn_workspace_task(
                    description,
                    prompt,
                    root,
                    WorkspaceTaskOptions {
                        origin_conversation: Some(ctx.call_id.clone()),
                    },
                )
                .await
                .map_err(|e| failed(self.name(), e))?,
            None => self
                .manager
                .spawn_prompt(description, prompt)
                .map_err(|e| failed(self.name(), e))?,
        };

        Ok(serde_json::json!({
            "task_id": handle.id,
            "status": "queued",
            "workspace": workspace,
        })
        .into())
    }
}

// ── check_task ──────────────────────────────────────────────────────────

pub struct CheckTaskTool {
    manager: Arc<TaskManager>,
}

impl CheckTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for CheckTaskTool {
    fn name(&self) -> &str {
        "check_task"
    }

    fn description(&self) -> &str {
        "Show a background task's status, progress, result or error, and its latest output lines."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" }
            },
            "required": ["task_id"]
        })
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = required_str(&arguments, "task_id")?;
        let record = self
            .manager
            .get_task(id)
            .ok_or_else(|| failed(self.name(), format!("No task with id '{id}'")))?;
        if record.status.is_terminal() {
            let _ = self.manager.mark_read(id);
        }
        Ok(describe(&record).into())
    }
}

fn describe(record: &TaskRecord) -> serde_json::Value {
    serde_json::json!({
        "task_id": record.id,
        "description": record.description,
        "status": record.status,
        "progress": record.progress,
        "result": record.result,
        "error": record.error,
        "workspace": record.workspace.as_ref().map(|w| w.path.display().to_string()),
        "output": record.output_log.tail(CHECK_TAIL_LINES),
    })
}

// ── cancel_task ─────────────────────────────────────────────────────────

pub struct CancelTaskTool {
    manager: Arc<TaskManager>,
}

impl CancelTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for CancelTaskTool {
    fn name(&self) -> &str {
        "cancel_task"
    }

    fn description(&self) -> &str {
        "Cancel a queued or running background task."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" }
            },
            "required": ["task_id"]
        })
    }

    fn mutates(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = required_str(&arguments, "task_id")?;
        self.manager
            .cancel_task(id)
            .map_err(|e| failed(self.name(), e))?;
        Ok(format!("Task {id} cancelled").into())
    }
}

// ── list_tasks ──────────────────────────────────────────────────────────

pub struct ListTasksTool {
    manager: Arc<TaskManager>,
}

impl ListTasksTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List background tasks with their status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn invoke(
        &self,
        _arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tasks = self.manager.list_tasks();
        if tasks.is_empty() {
            return Ok("No background tasks.".into());
        }
        Ok(tasks
            .iter()
            .map(TaskRecord::summary)
            .collect::<Vec<_>>()
            .join("\n")
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tidewire_config::TasksConfig;
    use tidewire_core::CancellationToken;
    use tidewire_security::WorkspacePolicy;

    use crate::manager::PromptRunner;
    use crate::record::TaskStatus;

    struct Slow;

    #[async_trait]
    impl PromptRunner for Slow {
        async fn run_prompt(&self, prompt: &str, cancel: CancellationToken) -> Result<String, String> {
            if prompt.contains("wait") {
                cancel.cancelled().await;
            }
            Ok(format!("did: {prompt}"))
        }
    }

    fn ctx(root: &std::path::Path) -> ToolContext {
        ToolContext {
            call_id: "call_1".into(),
            tool_name: "test".into(),
            workspace_root: root.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    fn setup(home: &std::path::Path) -> (Arc<TaskManager>, Arc<dyn PromptRunner>, ToolRegistry) {
        let manager = Arc::new(
            TaskManager::new(TasksConfig {
                poll_interval_ms: 5,
                ..TasksConfig::default()
            })
            .with_policy(WorkspacePolicy::default().with_home(home)),
        );
        let runner: Arc<dyn PromptRunner> = Arc::new(Slow);
        manager.set_prompt_runner(Arc::downgrade(&runner));
        let tools = task_tools(manager.clone());
        (manager, runner, tools)
    }

    async fn call(tools: &ToolRegistry, name: &str, args: serde_json::Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let tool = tools.get(name).unwrap();
        tool.invoke(args, ctx).await.map(ToolOutput::into_content)
    }

    #[tokio::test]
    async fn spawn_then_check_reports_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner, tools) = setup(dir.path());
        let ctx = ctx(dir.path());

        let out = call(
            &tools,
            "spawn_background_task",
            serde_json::json!({"description": "scan", "prompt": "scan the repo"}),
            &ctx,
        )
        .await
        .unwrap();
        let spawned: serde_json::Value = serde_json::from_str(&out).unwrap();
        let id = spawned["task_id"].as_str().unwrap().to_string();
        manager.wait_for_task(&id, Duration::from_secs(1)).await.unwrap();

        let out = call(&tools, "check_task", serde_json::json!({"task_id": id}), &ctx)
            .await
            .unwrap();
        let checked: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(checked["status"], "completed");
        assert_eq!(checked["result"], "did: scan the repo");
        assert!(manager.get_task(&id).unwrap().read);
    }

    #[tokio::test]
    async fn forbidden_workspace_is_a_tool_error_without_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner, tools) = setup(dir.path());

        let err = call(
            &tools,
            "spawn_background_task",
            serde_json::json!({"description": "x", "prompt": "y", "workspace": "/etc"}),
            &ctx(dir.path()),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("/etc"));
        assert!(manager.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn cancel_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner, tools) = setup(dir.path());
        let ctx = ctx(dir.path());
        let handle = manager.spawn_prompt("waiter", "wait for it").unwrap();

        let out = call(&tools, "cancel_task", serde_json::json!({"task_id": handle.id}), &ctx)
            .await
            .unwrap();
        assert!(out.contains("cancelled"));
        assert_eq!(manager.get_task(&handle.id).unwrap().status, TaskStatus::Cancelled);

        let listing = call(&tools, "list_tasks", serde_json::json!({}), &ctx).await.unwrap();
        assert!(listing.contains("[cancelled] waiter"));

        let missing = call(&tools, "check_task", serde_json::json!({"task_id": "nope"}), &ctx).await;
        assert!(missing.is_err());
        let bad_args = call(&tools, "cancel_task", serde_json::json!({}), &ctx).await;
        assert!(matches!(bad_args, Err(ToolError::InvalidArguments(_))));
    }

    #[test]
    fn registry_holds_all_four_tools() {
        let manager = Arc::new(TaskManager::new(TasksConfig::default()));
        let tools = task_tools(manager);
        assert_eq!(
            tools.names(),
            ["cancel_task", "check_task", "list_tasks", "spawn_background_task"]
        );
        assert!(tools.get("spawn_background_task").unwrap().mutates());
        assert!(!tools.get("check_task").unwrap().mutates());
    }
}
