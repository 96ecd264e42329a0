//! Response handling: the branch after each model call.
//!
//! A message with tool calls takes the tool branch: the assistant message is
//! appended, the calls run (in parallel when the batch is safe), and one
//! result per call is appended before the next model call. A text-only
//! message takes the final branch and ends the loop.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tidewire_core::history::HistoryStore;
use tidewire_core::message::{Message, Role, ToolCall};
use tidewire_core::provider::AssistantMessage;
use tidewire_core::request::RequestContext;
use tidewire_core::tool::ToolResult;
use tidewire_security::resolve_tool_path;
use tidewire_tools::ToolExecutor;
use tracing::{debug, info};

/// Whether the loop takes another turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Continue,
    Done,
}

/// How a batch of tool calls is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPlan {
    Parallel,
    Sequential,
}

pub struct ResponseHandler {
    executor: Arc<ToolExecutor>,
    read_only_tools: HashSet<String>,
    direct_answer_tools: HashSet<String>,
    direct_answer_grace_turns: u32,
}

impl ResponseHandler {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self {
            executor,
            read_only_tools: HashSet::new(),
            direct_answer_tools: HashSet::new(),
            direct_answer_grace_turns: 1,
        }
    }

    pub fn with_read_only_tools(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.read_only_tools = names.into_iter().collect();
        self
    }

    pub fn with_direct_answer_tools(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.direct_answer_tools = names.into_iter().collect();
        self
    }

    pub fn with_direct_answer_grace_turns(mut self, turns: u32) -> Self {
        self.direct_answer_grace_turns = turns;
        self
    }

    /// Decide whether `calls` may run concurrently.
    ///
    /// Read-only tools are safe whatever their arguments, unless they read a
    /// path another call in the batch writes. Any other call is unsafe when
    /// it is unknown, when its arguments do not parse, when it mutates
    /// without declaring which paths, or when it writes a path some other
    /// call also touches. One unsafe call makes the whole batch sequential.
    pub async fn plan_batch(&self, calls: &[ToolCall]) -> BatchPlan {
        if calls.len() < 2 {
            return BatchPlan::Sequential;
        }
        let root = self.executor.workspace_root();
        let mut reads: Vec<PathBuf> = Vec::new();
        let mut writes: HashSet<PathBuf> = HashSet::new();

        for call in calls {
            let read_only = self.read_only_tools.contains(call.name());
            let args = match call.parse_arguments() {
                Ok(args) => args,
                Err(_) if read_only => continue,
                Err(_) => {
                    debug!(tool = %call.name(), "Unparseable arguments, running batch sequentially");
                    return BatchPlan::Sequential;
                }
            };
            let keys = match self.executor.resolve(call.name()).await {
                Some((handler, _))
                    if !read_only && handler.mutates() && handler.path_arguments().is_empty() =>
                {
                    debug!(tool = %call.name(), "Mutating tool declares no paths, running batch sequentially");
                    return BatchPlan::Sequential;
                }
                Some((handler, _)) => handler.path_arguments(),
                None if read_only => &[],
                None => {
                    debug!(tool = %call.name(), "Unknown tool, running batch sequentially");
                    return BatchPlan::Sequential;
                }
            };
            for key in keys {
                let Some(raw) = args.get(*key).and_then(|v| v.as_str()) else {
                    continue;
                };
                let Ok(path) = resolve_tool_path(raw, root) else {
                    if read_only {
                        continue;
                    }
                    return BatchPlan::Sequential;
                };
                if read_only {
                    reads.push(path);
                } else if !writes.insert(path) {
                    debug!(tool = %call.name(), "Two calls write the same path, running batch sequentially");
                    return BatchPlan::Sequential;
                }
            }
        }

        if reads.iter().any(|p| writes.contains(p)) {
            debug!("A call reads a path another call writes, running batch sequentially");
            return BatchPlan::Sequential;
        }
        BatchPlan::Parallel
    }

    /// Handle one model message for `ctx`.
    pub async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &dyn HistoryStore,
        message: AssistantMessage,
    ) -> TurnOutcome {
        if message.tool_calls.is_empty() {
            ctx.set_final_response(message.content.unwrap_or_default());
            return TurnOutcome::Done;
        }

        if let Some(fired) = ctx.metadata.direct_answer_turn
            && ctx.turn_number >= fired + self.direct_answer_grace_turns
        {
            info!(
                request_id = %ctx.id,
                turn = ctx.turn_number,
                ignored_calls = message.tool_calls.len(),
                "Direct answer grace period over, ending loop"
            );
            let text = match message.content.filter(|c| !c.trim().is_empty()) {
                Some(text) => text,
                None => last_tool_output(history).unwrap_or_default(),
            };
            ctx.set_final_response(text);
            return TurnOutcome::Done;
        }

        let calls = message.tool_calls.clone();
        history.push_message(message.into_message());

        let plan = self.plan_batch(&calls).await;
        debug!(request_id = %ctx.id, turn = ctx.turn_number, calls = calls.len(), ?plan, "Executing tool calls");
        let results = match plan {
            BatchPlan::Parallel => {
                join_all(calls.iter().map(|call| self.executor.execute_tool(call, &ctx.cancel))).await
            }
            BatchPlan::Sequential => {
                let mut results = Vec::with_capacity(calls.len());
                for call in &calls {
                    results.push(self.executor.execute_tool(call, &ctx.cancel).await);
                }
                results
            }
        };

        ctx.tool_call_count += calls.len() as u32;
        for result in results {
            self.note_direct_answer(ctx, &result);
            history.push_message(result.into_message());
        }
        TurnOutcome::Continue
    }

    fn note_direct_answer(&self, ctx: &mut RequestContext, result: &ToolResult) {
        if ctx.metadata.direct_answer
            || result.is_error()
            || !self.direct_answer_tools.contains(&result.name)
        {
            return;
        }
        debug!(request_id = %ctx.id, tool = %result.name, turn = ctx.turn_number, "Direct answer tool fired");
        ctx.metadata.direct_answer = true;
        ctx.metadata.direct_answer_turn = Some(ctx.turn_number);
    }
}

fn last_tool_output(history: &dyn HistoryStore) -> Option<String> {
    history
        .get_history()
        .into_iter()
        .rev()
        .find(|m: &Message| m.role == Role::Tool)
        .map(|m| m.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tidewire_core::history::InMemoryHistory;
    use tidewire_core::tool::{SourceKind, ToolOutput, ToolRegistry};
    use tidewire_tools::{ExecutorConfig, FunctionTool, default_registry};

    const READ_ONLY: [&str; 2] = ["read_file", "list_dir"];

    fn handler_in(root: &std::path::Path, extra: Option<Arc<ToolRegistry>>) -> ResponseHandler {
        let mut executor = ToolExecutor::new(ExecutorConfig::new(root))
            .with_source(Arc::new(default_registry(&[])));
        if let Some(extra) = extra {
            executor = executor.with_source(extra);
        }
        ResponseHandler::new(Arc::new(executor))
            .with_read_only_tools(READ_ONLY.iter().map(|s| s.to_string()))
    }

    fn write(id: &str, path: &str) -> ToolCall {
        ToolCall::new(id, "write_file", serde_json::json!({"path": path, "content": id}).to_string())
    }

    fn read(id: &str, path: &str) -> ToolCall {
        ToolCall::new(id, "read_file", serde_json::json!({"path": path}).to_string())
    }

    #[tokio::test]
    async fn plan_rules() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler_in(dir.path(), None);

        assert_eq!(h.plan_batch(&[read("1", "a"), read("2", "a")]).await, BatchPlan::Parallel);
        assert_eq!(h.plan_batch(&[write("1", "a"), write("2", "b")]).await, BatchPlan::Parallel);
        assert_eq!(h.plan_batch(&[write("1", "a"), write("2", "a")]).await, BatchPlan::Sequential);
        assert_eq!(h.plan_batch(&[write("1", "a"), write("2", "./a")]).await, BatchPlan::Sequential);
        assert_eq!(h.plan_batch(&[write("1", "a"), read("2", "a")]).await, BatchPlan::Sequential);
        assert_eq!(
            h.plan_batch(&[write("1", "a"), ToolCall::new("2", "write_file", "{oops")]).await,
            BatchPlan::Sequential
        );
        // Read-only tools are safe even with broken arguments
        assert_eq!(
            h.plan_batch(&[write("1", "a"), ToolCall::new("2", "read_file", "{oops")]).await,
            BatchPlan::Parallel
        );
        assert_eq!(h.plan_batch(&[write("1", "a")]).await, BatchPlan::Sequential);
    }

    #[tokio::test]
    async fn undeclared_effects_force_sequential() {
        let dir = tempfile::tempdir().unwrap();
        fn noop(
            _: serde_json::Value,
            _: tidewire_core::tool::ToolContext,
        ) -> futures::future::BoxFuture<'static, Result<ToolOutput, tidewire_core::error::ToolError>> {
            Box::pin(async { Ok(ToolOutput::from("ok")) })
        }
        let registry = ToolRegistry::new(SourceKind::Custom);
        registry.register(Arc::new(
            FunctionTool::new("deploy", "", serde_json::json!({}), noop).mutating(),
        ));
        registry.register(Arc::new(FunctionTool::new("lookup", "", serde_json::json!({}), noop)));
        let h = handler_in(dir.path(), Some(Arc::new(registry)));
        let call = |id: &str, name: &str| ToolCall::new(id, name, "{}");

        // Mutating without declared paths: nothing to compare against
        assert_eq!(h.plan_batch(&[call("1", "deploy"), read("2", "a")]).await, BatchPlan::Sequential);
        // Unknown tools are not assumed safe
        assert_eq!(h.plan_batch(&[call("1", "nope"), read("2", "a")]).await, BatchPlan::Sequential);
        // Non-mutating tools without paths stay parallel
        assert_eq!(h.plan_batch(&[call("1", "lookup"), read("2", "a")]).await, BatchPlan::Parallel);
    }

    #[tokio::test]
    async fn text_message_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler_in(dir.path(), None);
        let history = InMemoryHistory::new();
        let mut ctx = RequestContext::new("hi", 5);
        let outcome = h.handle(&mut ctx, &history, AssistantMessage::text("done")).await;
        assert_eq!(outcome, TurnOutcome::Done);
        assert_eq!(ctx.final_response(), Some("done"));
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn every_call_gets_one_result_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler_in(dir.path(), None);
        let history = InMemoryHistory::new();
        let mut ctx = RequestContext::new("hi", 5);
        let calls = vec![write("w1", "x.txt"), read("r1", "x.txt"), ToolCall::new("u1", "nope", "{}")];
        let outcome = h
            .handle(&mut ctx, &history, AssistantMessage::with_tool_calls(None, calls))
            .await;
        assert_eq!(outcome, TurnOutcome::Continue);
        assert_eq!(ctx.tool_call_count, 3);

        let messages = history.get_history();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].tool_calls.len(), 3);
        let ids: Vec<_> = messages[1..]
            .iter()
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["w1", "r1", "u1"]);
        assert_eq!(messages[2].content, "w1");
        assert!(messages[3].content.starts_with("Error:"));
    }

    #[tokio::test]
    async fn same_path_writes_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (a, m) = (active.clone(), max_seen.clone());
        let slow_write = FunctionTool::new("slow_write", "", serde_json::json!({}), move |_, _| {
            let (a, m) = (a.clone(), m.clone());
            Box::pin(async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutput::from("ok"))
            })
        })
        .mutating()
        .with_path_arguments(&["path"]);
        let registry = ToolRegistry::new(SourceKind::Custom);
        registry.register(Arc::new(slow_write));
        let h = handler_in(dir.path(), Some(Arc::new(registry)));

        let calls = vec![
            ToolCall::new("1", "slow_write", r#"{"path":"a"}"#),
            ToolCall::new("2", "slow_write", r#"{"path":"a"}"#),
        ];
        let history = InMemoryHistory::new();
        let mut ctx = RequestContext::new("hi", 5);
        h.handle(&mut ctx, &history, AssistantMessage::with_tool_calls(None, calls))
            .await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        // Different paths do overlap
        let calls = vec![
            ToolCall::new("3", "slow_write", r#"{"path":"a"}"#),
            ToolCall::new("4", "slow_write", r#"{"path":"b"}"#),
        ];
        h.handle(&mut ctx, &history, AssistantMessage::with_tool_calls(None, calls))
            .await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn direct_answer_grace_forces_termination() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler_in(dir.path(), None)
            .with_direct_answer_tools(["list_dir".to_string()])
            .with_direct_answer_grace_turns(1);
        let history = InMemoryHistory::new();
        let mut ctx = RequestContext::new("what is here?", 10);

        ctx.begin_turn();
        let first = vec![ToolCall::new("l1", "list_dir", "{}")];
        h.handle(&mut ctx, &history, AssistantMessage::with_tool_calls(None, first))
            .await;
        assert_eq!(ctx.metadata.direct_answer_turn, Some(1));

        ctx.begin_turn();
        let more = vec![ToolCall::new("l2", "list_dir", "{}")];
        let outcome = h
            .handle(&mut ctx, &history, AssistantMessage::with_tool_calls(None, more))
            .await;
        assert_eq!(outcome, TurnOutcome::Done);
        assert_eq!(ctx.final_response(), Some("(empty directory)"));
        // The ignored call was never appended
        assert_eq!(history.len(), 2);
    }
}
