//! LLM invocation with failure classification.
//!
//! Transport failures (the model could not be reached) are recoverable: the
//! loop gets a continuation note and tries again. Anything else, including a
//! response without exactly one choice, ends the turn with an error text.

use std::sync::Arc;

use chrono::Utc;
use tidewire_core::error::ProviderError;
use tidewire_core::message::Message;
use tidewire_core::model::{ModelConfig, ReasoningEffort};
use tidewire_core::provider::{AssistantMessage, GenerateRequest, Provider, ToolDefinition};
use tidewire_core::{CancellationToken, DomainEvent, EventBus};
use tracing::{debug, warn};

/// What one model call produced.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Message(AssistantMessage),
    /// The model was unreachable; `note` tells the next turn what happened.
    TransportFailure { note: String },
    /// Terminal for the turn; `text` becomes the final response.
    Failed { text: String },
    Cancelled,
}

pub struct LlmCaller {
    temperature: f32,
    pub(crate) events: Option<Arc<EventBus>>,
}

impl LlmCaller {
    pub fn new(temperature: f32) -> Self {
        Self {
            temperature,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the generate request for `model`. Tools are only offered to
    /// models that can call them; effort only to models that accept it.
    pub fn request_for(
        &self,
        model: &ModelConfig,
        messages: Vec<Message>,
        tools: &[ToolDefinition],
        effort: ReasoningEffort,
    ) -> GenerateRequest {
        let mut request = GenerateRequest::new(model.model_id.clone(), messages);
        request.temperature = self.temperature;
        if model.supports_tool_calling {
            request.tools = tools.to_vec();
        }
        if model.max_output_tokens > 0 {
            request.max_tokens = u32::try_from(model.max_output_tokens).ok();
        }
        if model.supports_reasoning_effort {
            request.reasoning_effort = Some(effort);
        }
        request
    }

    pub async fn call(
        &self,
        request_id: &str,
        provider: &dyn Provider,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> CallOutcome {
        if cancel.is_cancelled() {
            return CallOutcome::Cancelled;
        }
        debug!(
            request_id,
            provider = provider.name(),
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling model"
        );

        let response = match provider.generate(request, cancel.clone()).await {
            Ok(response) => response,
            Err(ProviderError::Cancelled) => return CallOutcome::Cancelled,
            Err(e) if e.is_transport() => {
                warn!(request_id, error = %e, "Model unreachable");
                self.publish_failure(request_id, true, &e.to_string());
                return CallOutcome::TransportFailure {
                    note: format!(
                        "The previous model call failed before reaching the model ({e}). Continue from where you left off."
                    ),
                };
            }
            Err(e) => {
                warn!(request_id, error = %e, "Model call failed");
                self.publish_failure(request_id, false, &e.to_string());
                return CallOutcome::Failed {
                    text: format!("Error: the model call failed: {e}"),
                };
            }
        };

        let mut choices = response.choices;
        if choices.len() != 1 {
            let reason = format!("expected exactly one choice, got {}", choices.len());
            warn!(request_id, %reason, "Malformed model response");
            self.publish_failure(request_id, false, &reason);
            return CallOutcome::Failed {
                text: format!("Error: the model returned a malformed response ({reason})"),
            };
        }
        let message = choices.remove(0).message;
        if message.tool_calls.is_empty() && message.content_text().trim().is_empty() {
            self.publish_failure(request_id, false, "empty message");
            return CallOutcome::Failed {
                text: "Error: the model returned an empty response".into(),
            };
        }
        CallOutcome::Message(message)
    }

    fn publish_failure(&self, request_id: &str, recoverable: bool, error_message: &str) {
        if let Some(events) = &self.events {
            events.publish(DomainEvent::LlmCallFailed {
                request_id: request_id.to_string(),
                recoverable,
                error_message: error_message.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}
