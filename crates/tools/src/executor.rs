//! Tool executor: resolves a tool call to a handler and runs it safely.
//!
//! Resolution walks the sources in [`SourceKind`] order (built-in, custom,
//! plugin, remote). Every call races the handler against its timeout and the
//! caller's cancellation token. Failures of any kind come back as an
//! `"Error: …"` [`ToolResult`]; `execute_tool` never returns an error.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tidewire_config::ToolsConfig;
use tidewire_core::message::ToolCall;
use tidewire_core::provider::ToolDefinition;
use tidewire_core::tool::{SourceKind, ToolContext, ToolHandler, ToolResult, ToolSource};
use tidewire_core::{CancellationToken, DomainEvent, EventBus};
use tidewire_security::{is_within_root, resolve_tool_path};
use tracing::{debug, info, warn};

use crate::confirmation::ConfirmationGate;
use crate::dry_run::{DryRunRecorder, PlannedChange};
use crate::validate::WriteValidator;

/// Timeouts and modes for tool execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workspace_root: PathBuf,
    pub default_timeout: Duration,
    /// Applies to plugin-sourced tools without an explicit entry
    pub plugin_timeout: Duration,
    pub timeouts: HashMap<String, Duration>,
    pub dry_run: bool,
}

impl ExecutorConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self::from_config(&ToolsConfig::default(), workspace_root)
    }

    pub fn from_config(config: &ToolsConfig, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            plugin_timeout: Duration::from_secs(config.plugin_timeout_secs),
            timeouts: config
                .timeouts
                .iter()
                .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
                .collect(),
            dry_run: config.dry_run,
        }
    }

    pub fn with_timeout(mut self, tool_name: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts.insert(tool_name.into(), timeout);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

pub struct ToolExecutor {
    sources: Vec<Arc<dyn ToolSource>>,
    config: ExecutorConfig,
    gate: Option<Arc<ConfirmationGate>>,
    validator: Option<Arc<dyn WriteValidator>>,
    events: Option<Arc<EventBus>>,
    recorder: DryRunRecorder,
}

impl ToolExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            sources: Vec::new(),
            config,
            gate: None,
            validator: None,
            events: None,
            recorder: DryRunRecorder::new(),
        }
    }

    /// Add a tool source. Sources are kept in dispatch order; two sources of
    /// the same kind are consulted in insertion order.
    pub fn with_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.sources.push(source);
        self.sources.sort_by_key(|s| s.kind());
        self
    }

    /// Without a gate, access outside the workspace is denied outright.
    pub fn with_gate(mut self, gate: Arc<ConfirmationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn WriteValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.config.workspace_root
    }

    pub fn gate(&self) -> Option<&Arc<ConfirmationGate>> {
        self.gate.as_ref()
    }

    /// Find the handler for `name` and the kind of source it came from.
    pub async fn resolve(&self, name: &str) -> Option<(Arc<dyn ToolHandler>, SourceKind)> {
        for source in &self.sources {
            if let Some(handler) = source.resolve(name).await {
                return Some((handler, source.kind()));
            }
        }
        None
    }

    /// Definitions across all sources. A name shadowed by an earlier source
    /// is listed once.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = HashSet::new();
        let mut defs = Vec::new();
        for source in &self.sources {
            for def in source.definitions().await {
                if seen.insert(def.name.clone()) {
                    defs.push(def);
                }
            }
        }
        defs
    }

    pub fn timeout_for(&self, name: &str, kind: SourceKind) -> Duration {
        if let Some(timeout) = self.config.timeouts.get(name) {
            return *timeout;
        }
        match kind {
            SourceKind::Plugin => self.config.plugin_timeout,
            _ => self.config.default_timeout,
        }
    }

    /// Changes recorded while in dry-run mode.
    pub fn planned_changes(&self) -> Vec<PlannedChange> {
        self.recorder.changes()
    }

    /// Run one tool call to completion, timeout or cancellation.
    pub async fn execute_tool(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let started = Instant::now();
        let result = self.dispatch(call, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if result.is_error() {
            warn!(tool = %call.name(), call_id = %call.id, duration_ms, content = %result.content, "Tool failed");
        } else {
            debug!(tool = %call.name(), call_id = %call.id, duration_ms, "Tool succeeded");
        }
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ToolExecuted {
                tool_name: call.name().to_string(),
                success: !result.is_error(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }
        result
    }

    async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let name = call.name();
        let id = call.id.as_str();

        if cancel.is_cancelled() {
            return ToolResult::error(id, name, "Execution cancelled");
        }

        let arguments = match call.parse_arguments() {
            Ok(args) => args,
            Err(e) => return ToolResult::error(id, name, format!("Invalid arguments for '{name}': {e}")),
        };

        let Some((handler, kind)) = self.resolve(name).await else {
            return ToolResult::error(id, name, format!("Unknown tool '{name}'"));
        };

        let paths = match self.check_paths(handler.as_ref(), &arguments, cancel).await {
            Ok(paths) => paths,
            Err(message) => return ToolResult::error(id, name, message),
        };

        if self.config.dry_run && handler.mutates() {
            let shown = paths.iter().map(|p| p.display().to_string()).collect();
            return ToolResult::success(id, name, self.recorder.record(name, arguments, shown));
        }

        let ctx = ToolContext {
            call_id: id.to_string(),
            tool_name: name.to_string(),
            workspace_root: self.config.workspace_root.clone(),
            cancel: cancel.child_token(),
        };
        let timeout = self.timeout_for(name, kind);
        debug!(tool = name, source = %kind, ?timeout, "Dispatching tool");

        let invocation = AssertUnwindSafe(handler.invoke(arguments, &ctx)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ctx.cancel.cancel();
                info!(tool = name, call_id = id, "Tool cancelled");
                return ToolResult::error(id, name, "Execution cancelled");
            }
            outcome = tokio::time::timeout(timeout, invocation) => outcome,
        };

        let output = match outcome {
            Err(_) => {
                ctx.cancel.cancel();
                return ToolResult::error(
                    id,
                    name,
                    format!("Tool '{name}' timed out after {timeout:?}"),
                );
            }
            Ok(Err(panic)) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                return ToolResult::error(id, name, format!("Tool '{name}' panicked: {reason}"));
            }
            Ok(Ok(Err(e))) => return ToolResult::error(id, name, e),
            Ok(Ok(Ok(output))) => output,
        };

        let mut content = output.into_content();
        if handler.mutates()
            && let Some(validator) = &self.validator
        {
            for path in &paths {
                if let Some(advisory) = validator.validate(path, cancel).await {
                    content.push_str("\n\n");
                    content.push_str(&advisory);
                }
            }
        }
        ToolResult::success(id, name, content)
    }

    /// Resolve the handler's path arguments and run the confirmation gate for
    /// any that fall outside the workspace.
    async fn check_paths(
        &self,
        handler: &dyn ToolHandler,
        arguments: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, String> {
        let root = &self.config.workspace_root;
        let mut paths = Vec::new();
        for key in handler.path_arguments() {
            let Some(raw) = arguments.get(*key).and_then(|v| v.as_str()) else {
                continue;
            };
            let path = resolve_tool_path(raw, root).map_err(|e| e.to_string())?;
            if !is_within_root(&path, root) {
                let Some(gate) = &self.gate else {
                    return Err(format!(
                        "Access to '{}' outside the workspace is not allowed",
                        path.display()
                    ));
                };
                let decision = gate.confirm(handler.name(), &path, cancel).await;
                if !decision.is_allowed() {
                    return Err(format!(
                        "Access to '{}' outside the workspace was denied",
                        path.display()
                    ));
                }
            }
            paths.push(path);
        }
        Ok(paths)
    }

    /// Shut down every source (closes remote servers, unloads plugins).
    pub async fn shutdown(&self) {
        for source in &self.sources {
            source.shutdown().await;
        }
        info!(sources = self.sources.len(), "Tool sources shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::Decision;
    use crate::sources::FunctionTool;
    use crate::sources::tests::EchoServer;
    use crate::{RemoteSource, default_registry};
    use tidewire_core::error::ToolError;
    use tidewire_core::tool::{ToolOutput, ToolRegistry};

    fn pending_tool(name: &str) -> FunctionTool {
        FunctionTool::new(name, "Never finishes", serde_json::json!({}), |_, _| {
            Box::pin(async {
                std::future::pending::<()>().await;
                Ok(ToolOutput::from("unreachable"))
            })
        })
    }

    fn executor_in(root: &Path) -> ToolExecutor {
        ToolExecutor::new(ExecutorConfig::new(root))
            .with_source(Arc::new(default_registry(&[])))
    }

    fn custom(tools: Vec<FunctionTool>) -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new(SourceKind::Custom);
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_in(dir.path());
        let result = exec
            .execute_tool(&ToolCall::new("c1", "nope", "{}"), &CancellationToken::new())
            .await;
        assert!(result.is_error());
        assert_eq!(result.tool_call_id, "c1");
        assert!(result.content.contains("Unknown tool 'nope'"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_in(dir.path());
        let result = exec
            .execute_tool(&ToolCall::new("c1", "read_file", "{not json"), &CancellationToken::new())
            .await;
        assert!(result.is_error());
        assert!(result.content.contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn write_then_read_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_in(dir.path());
        let cancel = CancellationToken::new();
        let write = exec
            .execute_tool(
                &ToolCall::new("w", "write_file", r#"{"path":"a.txt","content":"hello"}"#),
                &cancel,
            )
            .await;
        assert!(!write.is_error(), "{}", write.content);
        let read = exec
            .execute_tool(&ToolCall::new("r", "read_file", r#"{"path":"a.txt"}"#), &cancel)
            .await;
        assert_eq!(read.content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_tool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ToolExecutor::new(
            ExecutorConfig::new(dir.path()).with_timeout("hang", Duration::from_secs(5)),
        )
        .with_source(custom(vec![pending_tool("hang")]));

        let started = tokio::time::Instant::now();
        let result = exec
            .execute_tool(&ToolCall::new("c1", "hang", "{}"), &CancellationToken::new())
            .await;
        assert!(result.is_error());
        assert!(result.content.contains("timed out"), "{}", result.content);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_tools_use_plugin_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = ToolRegistry::new(SourceKind::Plugin);
        plugins.register(Arc::new(pending_tool("slow_plugin")));
        let mut config = ExecutorConfig::new(dir.path());
        config.plugin_timeout = Duration::from_secs(2);
        let exec = ToolExecutor::new(config).with_source(Arc::new(plugins));

        assert_eq!(exec.timeout_for("slow_plugin", SourceKind::Plugin), Duration::from_secs(2));
        let result = exec
            .execute_tool(&ToolCall::new("c1", "slow_plugin", "{}"), &CancellationToken::new())
            .await;
        assert!(result.content.contains("timed out after 2s"), "{}", result.content);
    }

    #[tokio::test]
    async fn cancellation_mid_execution() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_in(dir.path()).with_source(custom(vec![pending_tool("hang")]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = exec
            .execute_tool(&ToolCall::new("c1", "hang", "{}"), &cancel)
            .await;
        assert_eq!(result.content, "Error: Execution cancelled");
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_results() {
        let dir = tempfile::tempdir().unwrap();
        let failing = FunctionTool::new("fail", "", serde_json::json!({}), |_, _| {
            Box::pin(async {
                Err(ToolError::ExecutionFailed {
                    tool_name: "fail".into(),
                    reason: "boom".into(),
                })
            })
        });
        let panicking = FunctionTool::new("panic", "", serde_json::json!({}), |_, _| {
            Box::pin(async {
                let output: Option<ToolOutput> = None;
                Ok(output.expect("kaboom"))
            })
        });
        let exec = executor_in(dir.path()).with_source(custom(vec![failing, panicking]));
        let cancel = CancellationToken::new();

        let result = exec.execute_tool(&ToolCall::new("a", "fail", "{}"), &cancel).await;
        assert!(result.is_error());
        assert!(result.content.contains("boom"));

        let result = exec.execute_tool(&ToolCall::new("b", "panic", "{}"), &cancel).await;
        assert!(result.is_error());
        assert!(result.content.contains("kaboom"));
    }

    #[tokio::test]
    async fn builtin_shadows_custom_and_definitions_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let shadow = FunctionTool::new("read_file", "shadow", serde_json::json!({}), |_, _| {
            Box::pin(async { Ok(ToolOutput::from("custom")) })
        });
        let exec = executor_in(dir.path()).with_source(custom(vec![shadow]));
        let (_, kind) = exec.resolve("read_file").await.unwrap();
        assert_eq!(kind, SourceKind::Builtin);

        let defs = exec.definitions().await;
        assert_eq!(defs.iter().filter(|d| d.name == "read_file").count(), 1);
    }

    #[tokio::test]
    async fn remote_tools_are_dispatched_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(RemoteSource::new());
        remote.connect(Arc::new(EchoServer::new("srv"))).await.unwrap();
        let exec = executor_in(dir.path()).with_source(remote);
        let result = exec
            .execute_tool(&ToolCall::new("c1", "srv__echo", r#"{"x":1}"#), &CancellationToken::new())
            .await;
        assert!(!result.is_error());
        assert!(result.content.starts_with("srv:echo:"));
    }

    #[tokio::test]
    async fn outside_path_without_gate_is_denied() {
        let workspace = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("x.txt"), "secret").unwrap();
        let exec = executor_in(workspace.path());
        let args = serde_json::json!({"path": outside.path().join("x.txt")}).to_string();
        let result = exec
            .execute_tool(&ToolCall::new("c1", "read_file", args), &CancellationToken::new())
            .await;
        assert!(result.is_error());
        assert!(result.content.contains("outside the workspace"));
    }

    #[tokio::test]
    async fn gate_allows_outside_access() {
        let workspace = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("x.txt"), "visible").unwrap();
        let exec = executor_in(workspace.path())
            .with_gate(Arc::new(ConfirmationGate::auto(Decision::AllowOnce)));
        let args = serde_json::json!({"path": outside.path().join("x.txt")}).to_string();
        let result = exec
            .execute_tool(&ToolCall::new("c1", "read_file", args), &CancellationToken::new())
            .await;
        assert_eq!(result.content, "visible");
    }

    #[tokio::test]
    async fn dry_run_records_instead_of_writing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ToolExecutor::new(ExecutorConfig::new(dir.path()).with_dry_run(true))
            .with_source(Arc::new(default_registry(&[])));
        let result = exec
            .execute_tool(
                &ToolCall::new("w", "write_file", r#"{"path":"a.txt","content":"x"}"#),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.content.starts_with("[DRY RUN]"));
        assert!(!dir.path().join("a.txt").exists());
        let planned = exec.planned_changes();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].tool_name, "write_file");

        // Read-only tools still run
        let list = exec
            .execute_tool(&ToolCall::new("l", "list_dir", "{}"), &CancellationToken::new())
            .await;
        assert_eq!(list.content, "(empty directory)");
    }

    struct Flagging;

    #[async_trait::async_trait]
    impl WriteValidator for Flagging {
        async fn validate(&self, path: &Path, _cancel: &CancellationToken) -> Option<String> {
            Some(format!("Validation issues:\n{}: trailing whitespace", path.display()))
        }
    }

    #[tokio::test]
    async fn validator_output_is_appended_to_write_result() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_in(dir.path()).with_validator(Arc::new(Flagging));
        let result = exec
            .execute_tool(
                &ToolCall::new("w", "write_file", r#"{"path":"a.txt","content":"x "}"#),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.content.starts_with("Successfully wrote"));
        assert!(result.content.contains("trailing whitespace"));
    }

    #[tokio::test]
    async fn tool_executed_event_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(8));
        let mut rx = bus.subscribe();
        let exec = executor_in(dir.path()).with_events(bus);
        exec.execute_tool(&ToolCall::new("l", "list_dir", "{}"), &CancellationToken::new())
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            DomainEvent::ToolExecuted { tool_name, success: true, .. } if tool_name == "list_dir"
        ));
    }
}
