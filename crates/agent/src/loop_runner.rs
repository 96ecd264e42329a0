//! The agent turn loop.
//!
//! Each turn resolves a model, builds the prompt, calls the model and hands
//! the response to the [`ResponseHandler`]. The loop ends on the first final
//! text, on cancellation, on a terminal model error, or when the turn budget
//! runs out. In every case the context leaves with a final response set.

use std::sync::Arc;

use chrono::Utc;
use tidewire_config::AppConfig;
use tidewire_core::error::{Error, ProviderError};
use tidewire_core::history::HistoryStore;
use tidewire_core::message::Role;
use tidewire_core::request::RequestContext;
use tidewire_core::{DomainEvent, EventBus};
use tidewire_providers::ModelRouter;
use tidewire_tools::ToolExecutor;
use tracing::{debug, info, warn};

use crate::budget::MessageBudgeter;
use crate::caller::{CallOutcome, LlmCaller};
use crate::reasoning::{EffortClassifier, PatternClassifier, resolve_effort};
use crate::response::{ResponseHandler, TurnOutcome};

/// Reply used when the loop runs out of turns without a final answer.
pub const EXHAUSTED_RESPONSE: &str =
    "I could not determine a final answer within the allowed number of steps.";

pub const CANCELLED_RESPONSE: &str = "The request was cancelled.";

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Answered,
    Exhausted,
    Cancelled,
    /// A terminal model error, or too many transport failures in a row
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSummary {
    pub exit: LoopExit,
    pub turns: u32,
    pub tool_calls: u32,
}

pub struct AgentLoop {
    router: Arc<ModelRouter>,
    executor: Arc<ToolExecutor>,
    budgeter: MessageBudgeter,
    caller: LlmCaller,
    handler: ResponseHandler,
    classifier: Arc<dyn EffortClassifier>,
    events: Option<Arc<EventBus>>,
    max_transport_failures: u32,
}

impl AgentLoop {
    pub fn new(router: Arc<ModelRouter>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            router,
            budgeter: MessageBudgeter::new(10),
            caller: LlmCaller::new(0.7),
            handler: ResponseHandler::new(executor.clone()),
            executor,
            classifier: Arc::new(PatternClassifier::default()),
            events: None,
            max_transport_failures: 2,
        }
    }

    /// Build a loop with every policy taken from `config`.
    pub fn from_config(
        config: &AppConfig,
        router: Arc<ModelRouter>,
        executor: Arc<ToolExecutor>,
    ) -> Result<Self, Error> {
        let classifier = PatternClassifier::from_config(&config.agent).map_err(|e| Error::Config {
            message: format!("invalid reasoning pattern: {e}"),
        })?;
        let agent = &config.agent;
        Ok(Self::new(router, executor.clone())
            .with_budgeter(
                MessageBudgeter::new(agent.history_exchanges)
                    .with_system_prompt(agent.system_prompt.clone()),
            )
            .with_caller(LlmCaller::new(config.default_temperature))
            .with_handler(
                ResponseHandler::new(executor)
                    .with_read_only_tools(config.tools.read_only_tools.iter().cloned())
                    .with_direct_answer_tools(agent.direct_answer_tools.iter().cloned())
                    .with_direct_answer_grace_turns(agent.direct_answer_grace_turns),
            )
            .with_classifier(Arc::new(classifier))
            .with_max_transport_failures(agent.max_transport_failures))
    }

    pub fn with_budgeter(mut self, budgeter: MessageBudgeter) -> Self {
        self.budgeter = budgeter;
        self
    }

    pub fn with_caller(mut self, mut caller: LlmCaller) -> Self {
        if caller.events.is_none() {
            caller.events = self.events.clone();
        }
        self.caller = caller;
        self
    }

    pub fn with_handler(mut self, handler: ResponseHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn EffortClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.caller.events = Some(events.clone());
        self.events = Some(events);
        self
    }

    pub fn with_max_transport_failures(mut self, max: u32) -> Self {
        self.max_transport_failures = max.max(1);
        self
    }

    /// Drive `ctx` to a final response.
    ///
    /// Only structural problems (no provider for the resolved model) are
    /// returned as errors; model and tool failures end up in the response.
    pub async fn run(
        &self,
        ctx: &mut RequestContext,
        history: &dyn HistoryStore,
    ) -> Result<LoopSummary, Error> {
        let tools = self.executor.definitions().await;
        let mut transport_failures = 0;
        let mut transport_note: Option<String> = None;

        let exit = loop {
            if ctx.is_cancelled() {
                break LoopExit::Cancelled;
            }
            if !ctx.begin_turn() {
                warn!(request_id = %ctx.id, max_turns = ctx.max_turns, "Turn budget exhausted");
                break LoopExit::Exhausted;
            }
            self.publish(DomainEvent::TurnStarted {
                request_id: ctx.id.clone(),
                turn: ctx.turn_number,
                max_turns: ctx.max_turns,
                timestamp: Utc::now(),
            });

            // Resolve model
            let (effort, source) = resolve_effort(ctx, self.classifier.as_ref());
            let resolution = self.router.resolve_for_effort(effort, !tools.is_empty());
            let model = ModelRouter::with_model_override(resolution.config, ctx.model.as_deref());
            debug!(
                request_id = %ctx.id,
                turn = ctx.turn_number,
                %effort,
                ?source,
                role = %resolution.role,
                model = %model.model_id,
                fell_back = resolution.fell_back,
                "Model resolved"
            );
            self.publish(DomainEvent::ModelResolved {
                request_id: ctx.id.clone(),
                role: resolution.role.to_string(),
                model_id: model.model_id.clone(),
                effort: effort.to_string(),
                timestamp: Utc::now(),
            });
            let provider = self.router.provider_for(&model).ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "no provider '{}' for model '{}'",
                    model.provider, model.model_id
                ))
            })?;

            // Build messages
            while let Some(chime) = ctx.metadata.chime_in.pop_front() {
                history.add_message(Role::User, &chime);
            }
            let offered = if model.supports_tool_calling {
                tools.as_slice()
            } else {
                &[]
            };
            let built = self.budgeter.build(ctx, history, &model, offered).await;

            // Call the model
            let request = self.caller.request_for(&model, built.messages, offered, effort);
            let outcome = self
                .caller
                .call(&ctx.id, provider.as_ref(), request, &ctx.cancel)
                .await;

            // Handle the response
            match outcome {
                CallOutcome::Message(message) => {
                    transport_failures = 0;
                    if let Some(note) = transport_note.take() {
                        ctx.metadata.notices.retain(|n| *n != note);
                    }
                    if self.handler.handle(ctx, history, message).await == TurnOutcome::Done {
                        break LoopExit::Answered;
                    }
                }
                CallOutcome::TransportFailure { note } => {
                    transport_failures += 1;
                    ctx.record_error("agent_loop", note.clone());
                    if transport_failures >= self.max_transport_failures {
                        ctx.set_final_response(format!(
                            "Error: the model could not be reached after {transport_failures} attempts."
                        ));
                        break LoopExit::Failed;
                    }
                    if transport_note.is_none() {
                        ctx.metadata.notices.push(note.clone());
                        transport_note = Some(note);
                    }
                }
                CallOutcome::Failed { text } => {
                    ctx.record_error("agent_loop", text.clone());
                    ctx.set_final_response(text);
                    break LoopExit::Failed;
                }
                CallOutcome::Cancelled => break LoopExit::Cancelled,
            }
        };

        if let Some(note) = transport_note {
            ctx.metadata.notices.retain(|n| *n != note);
        }
        match exit {
            LoopExit::Exhausted => {
                ctx.set_final_response(EXHAUSTED_RESPONSE);
            }
            LoopExit::Cancelled => {
                ctx.set_final_response(CANCELLED_RESPONSE);
            }
            LoopExit::Answered | LoopExit::Failed => {}
        }

        info!(
            request_id = %ctx.id,
            ?exit,
            turns = ctx.turn_number,
            tool_calls = ctx.tool_call_count,
            "Agent loop finished"
        );
        Ok(LoopSummary {
            exit,
            turns: ctx.turn_number,
            tool_calls: ctx.tool_call_count,
        })
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tidewire_core::history::InMemoryHistory;
    use tidewire_core::message::ToolCall;
    use tidewire_core::model::{ModelConfig, ReasoningEffort, TaskRole};
    use tidewire_core::tool::{SourceKind, ToolOutput, ToolRegistry};
    use tidewire_providers::{ScriptStep, ScriptedProvider};
    use tidewire_tools::{ExecutorConfig, FunctionTool, default_registry};

    fn model(id: &str, tools: bool) -> ModelConfig {
        ModelConfig {
            model_id: id.into(),
            provider: "scripted".into(),
            context_window: 32_000,
            max_output_tokens: 1000,
            supports_tool_calling: tools,
            supports_reasoning_effort: false,
        }
    }

    fn agent(root: &Path, provider: Arc<ScriptedProvider>, max_failures: u32) -> AgentLoop {
        let router = ModelRouter::new(model("general", true)).with_provider("scripted", provider);
        let hang = FunctionTool::new("hang", "Never returns", serde_json::json!({}), |_, _| {
            Box::pin(async {
                std::future::pending::<()>().await;
                Ok(ToolOutput::from(""))
            })
        });
        let custom = ToolRegistry::new(SourceKind::Custom);
        custom.register(Arc::new(hang));
        let executor = Arc::new(
            ToolExecutor::new(ExecutorConfig::new(root))
                .with_source(Arc::new(default_registry(&[])))
                .with_source(Arc::new(custom)),
        );
        AgentLoop::new(Arc::new(router), executor).with_max_transport_failures(max_failures)
    }

    fn user_history(text: &str) -> InMemoryHistory {
        let h = InMemoryHistory::new();
        h.add_message(Role::User, text);
        h
    }

    #[tokio::test]
    async fn text_answer_ends_first_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("Hello!")]));
        let agent = agent(dir.path(), provider.clone(), 2);
        let mut ctx = RequestContext::new("hi", 5);
        let summary = agent.run(&mut ctx, &user_history("hi")).await.unwrap();
        assert_eq!(summary.exit, LoopExit::Answered);
        assert_eq!(summary.turns, 1);
        assert_eq!(ctx.final_response(), Some("Hello!"));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn tool_turn_then_answer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptStep::tool_calls(vec![ToolCall::new(
                "c1",
                "read_file",
                r#"{"path":"notes.txt"}"#,
            )]),
            ScriptStep::text("The note says to remember the milk."),
        ]));
        let agent = agent(dir.path(), provider.clone(), 2);
        let history = user_history("what does my note say?");
        let mut ctx = RequestContext::new("what does my note say?", 5);
        let summary = agent.run(&mut ctx, &history).await.unwrap();

        assert_eq!(summary.turns, 2);
        assert_eq!(summary.tool_calls, 1);
        // The second request saw the tool result
        let second = &provider.requests()[1];
        let result = second
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(result.content, "remember the milk");
        assert_eq!(result.tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn turn_budget_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let steps = (0..5)
            .map(|i| {
                ScriptStep::tool_calls(vec![ToolCall::new(format!("c{i}"), "list_dir", "{}")])
            })
            .collect();
        let provider = Arc::new(ScriptedProvider::new(steps));
        let agent = agent(dir.path(), provider.clone(), 2);
        let mut ctx = RequestContext::new("loop forever", 3);
        let summary = agent.run(&mut ctx, &user_history("loop forever")).await.unwrap();
        assert_eq!(summary.exit, LoopExit::Exhausted);
        assert_eq!(ctx.turn_number, 3);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(ctx.final_response(), Some(EXHAUSTED_RESPONSE));
    }

    #[tokio::test]
    async fn transport_failure_recovers_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptStep::network_error(),
            ScriptStep::text("recovered"),
        ]));
        let recovering = agent(dir.path(), provider.clone(), 2);
        let mut ctx = RequestContext::new("hi", 5);
        recovering.run(&mut ctx, &user_history("hi")).await.unwrap();
        assert_eq!(ctx.final_response(), Some("recovered"));
        assert_eq!(ctx.errors.len(), 1);
        // The retry told the model what happened
        let second = &provider.requests()[1];
        assert!(second.messages.iter().any(|m| m.content.contains("failed before reaching")));
        assert!(ctx.metadata.notices.is_empty());

        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptStep::network_error(),
            ScriptStep::network_error(),
        ]));
        let failing = agent(dir.path(), provider, 2);
        let mut ctx = RequestContext::new("hi", 5);
        let summary = failing.run(&mut ctx, &user_history("hi")).await.unwrap();
        assert_eq!(summary.exit, LoopExit::Failed);
        assert!(ctx.final_response().unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn malformed_response_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::empty()]));
        let agent = agent(dir.path(), provider.clone(), 2);
        let mut ctx = RequestContext::new("hi", 5);
        let summary = agent.run(&mut ctx, &user_history("hi")).await.unwrap();
        assert_eq!(summary.exit, LoopExit::Failed);
        assert_eq!(provider.call_count(), 1);
        assert!(ctx.final_response().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn cancel_during_tool_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptStep::tool_calls(vec![ToolCall::new("c1", "hang", "{}")]),
            ScriptStep::text("should never be requested"),
        ]));
        let agent = agent(dir.path(), provider.clone(), 2);
        let history = user_history("hang please");
        let mut ctx = RequestContext::new("hang please", 5);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let summary = agent.run(&mut ctx, &history).await.unwrap();

        assert_eq!(summary.exit, LoopExit::Cancelled);
        assert_eq!(provider.call_count(), 1);
        let last = history.get_history().pop().unwrap();
        assert_eq!(last.content, "Error: Execution cancelled");
        assert_eq!(ctx.final_response(), Some(CANCELLED_RESPONSE));
    }

    #[tokio::test]
    async fn tool_less_model_falls_back_to_tool_role() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("ok")]));
        let router = ModelRouter::new(model("general", true))
            .with_role(TaskRole::Fast, model("fast-no-tools", false))
            .with_provider("scripted", provider.clone());
        let executor = Arc::new(
            ToolExecutor::new(ExecutorConfig::new(dir.path()))
                .with_source(Arc::new(default_registry(&[]))),
        );
        let agent = AgentLoop::new(Arc::new(router), executor);
        let mut ctx = RequestContext::new("hi", 5).with_reasoning_level(ReasoningEffort::Low);
        agent.run(&mut ctx, &user_history("hi")).await.unwrap();
        let request = &provider.requests()[0];
        assert_eq!(request.model, "general");
        assert!(!request.tools.is_empty());
    }

    #[tokio::test]
    async fn chime_in_messages_join_history() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::text("ok")]));
        let agent = agent(dir.path(), provider.clone(), 2);
        let history = user_history("first");
        let mut ctx = RequestContext::new("first", 5);
        ctx.metadata.chime_in.push_back("and also this".into());
        agent.run(&mut ctx, &history).await.unwrap();
        let sent = &provider.requests()[0].messages;
        assert_eq!(sent.last().unwrap().content, "and also this");
        assert_eq!(history.len(), 2);
    }
}
