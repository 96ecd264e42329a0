//! Message budgeting: assembles the prompt for one turn.
//!
//! The prompt is the system prompt, the last K exchanges from history, and
//! any injected system notes spliced in just ahead of the most recent user
//! message. The result is fitted to the model's prompt budget by dropping
//! the oldest non-system messages first.

use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::history::HistoryStore;
use tidewire_core::message::{Message, Role};
use tidewire_core::model::ModelConfig;
use tidewire_core::provider::ToolDefinition;
use tidewire_core::request::RequestContext;
use tidewire_core::CancellationToken;
use tracing::debug;

use crate::token::{estimate_messages_tokens, estimate_tools_tokens};

/// An optional source of extra context for a user turn (retrieval, a
/// reasoning-state summary).
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn label(&self) -> &str;

    /// Context for `input`, or `None` when there is nothing worth adding.
    async fn context_for(&self, input: &str, cancel: &CancellationToken) -> Option<String>;
}

/// The messages for one LLM call.
#[derive(Debug, Clone)]
pub struct BuiltMessages {
    pub messages: Vec<Message>,
    /// Older messages were dropped to fit the budget
    pub trimmed: bool,
    pub estimated_tokens: usize,
}

pub struct MessageBudgeter {
    history_exchanges: usize,
    system_prompt: Option<String>,
    retrieved_context: Option<Arc<dyn ContextProvider>>,
    reasoning_state: Option<Arc<dyn ContextProvider>>,
}

impl MessageBudgeter {
    pub fn new(history_exchanges: usize) -> Self {
        Self {
            history_exchanges,
            system_prompt: None,
            retrieved_context: None,
            reasoning_state: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_retrieved_context(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.retrieved_context = Some(provider);
        self
    }

    pub fn with_reasoning_state(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.reasoning_state = Some(provider);
        self
    }

    /// Build the prompt for the next turn of `ctx`.
    pub async fn build(
        &self,
        ctx: &mut RequestContext,
        history: &dyn HistoryStore,
        model: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> BuiltMessages {
        if !ctx.metadata.context_injected {
            self.gather_injections(ctx).await;
        }

        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(history.get_last_exchanges(self.history_exchanges));

        let notes: Vec<Message> = ctx
            .metadata
            .notices
            .iter()
            .chain(ctx.metadata.injected_context.iter())
            .map(|note| Message::system(note.clone()))
            .collect();
        if !notes.is_empty() {
            let at = messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .unwrap_or(messages.len());
            messages.splice(at..at, notes);
        }

        let budget = model
            .prompt_budget()
            .saturating_sub(estimate_tools_tokens(tools));
        let trimmed = fit_to_budget(&mut messages, budget);
        let estimated_tokens = estimate_messages_tokens(&messages);
        if trimmed {
            debug!(
                request_id = %ctx.id,
                budget,
                estimated_tokens,
                kept = messages.len(),
                "Prompt trimmed to fit budget"
            );
        }

        BuiltMessages {
            messages,
            trimmed,
            estimated_tokens,
        }
    }

    async fn gather_injections(&self, ctx: &mut RequestContext) {
        ctx.metadata.context_injected = true;
        for provider in [&self.retrieved_context, &self.reasoning_state]
            .into_iter()
            .flatten()
        {
            let found = provider.context_for(&ctx.user_input, &ctx.cancel).await;
            if let Some(text) = found
                && !text.trim().is_empty()
            {
                debug!(request_id = %ctx.id, source = provider.label(), "Context injected");
                ctx.metadata.injected_context.push(text);
            }
        }
    }
}

/// Drop the oldest non-system messages until `messages` fits `budget`.
/// Tool results go together with the assistant message that requested them,
/// and the group holding the final message is always kept. Returns whether anything was dropped.
pub fn fit_to_budget(messages: &mut Vec<Message>, budget: usize) -> bool {
    let mut trimmed = false;
    while estimate_messages_tokens(messages) > budget {
        let Some(oldest) = messages.iter().position(|m| m.role != Role::System) else {
            break;
        };
        // An assistant turn leaves together with all of its tool results
        let mut end = oldest + 1;
        while end < messages.len() && messages[end].role == Role::Tool {
            end += 1;
        }
        if end >= messages.len() {
            break;
        }
        messages.drain(oldest..end);
        trimmed = true;
    }
    trimmed
}
