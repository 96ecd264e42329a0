//! A provider that replays a fixed script of responses.
//!
//! Used by tests across the workspace and for offline runs of the binary.
//! Every request is recorded so callers can assert on what the model saw.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tidewire_core::error::ProviderError;
use tidewire_core::message::ToolCall;
use tidewire_core::provider::{AssistantMessage, GenerateRequest, GenerateResponse, Provider};
use tidewire_core::CancellationToken;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(GenerateResponse),
    Fail(ProviderError),
    /// Never answer; resolve only once the request is cancelled
    Stall,
    /// Wait, then play the inner step
    Delay(Duration, Box<ScriptStep>),
}

impl ScriptStep {
    /// A plain text answer.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Respond(GenerateResponse::single(AssistantMessage::text(content)))
    }

    /// An assistant message requesting tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::Respond(GenerateResponse::single(AssistantMessage::with_tool_calls(
            None, calls,
        )))
    }

    /// A response with no choices at all.
    pub fn empty() -> Self {
        Self::Respond(GenerateResponse::default())
    }

    /// A connection failure.
    pub fn network_error() -> Self {
        Self::Fail(ProviderError::Network("connection refused".into()))
    }

    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delay(delay, Box::new(self))
    }
}

/// A provider that returns scripted responses in order.
pub struct ScriptedProvider {
    name: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    /// Answer given once the script runs out
    fallback: Option<String>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            name: "scripted".into(),
            steps: Mutex::new(steps.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers every request with the same text.
    pub fn repeating(text: impl Into<String>) -> Self {
        Self::new(vec![]).with_fallback(text)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_step(&self) -> Option<ScriptStep> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    async fn play(
        &self,
        step: ScriptStep,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, ProviderError> {
        let mut step = step;
        loop {
            match step {
                ScriptStep::Respond(response) => return Ok(response),
                ScriptStep::Fail(err) => return Err(err),
                ScriptStep::Stall => {
                    cancel.cancelled().await;
                    return Err(ProviderError::Cancelled);
                }
                ScriptStep::Delay(delay, inner) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    step = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResponse, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        match self.next_step() {
            Some(step) => self.play(step, &cancel).await,
            None => match &self.fallback {
                Some(text) => Ok(GenerateResponse::single(AssistantMessage::text(text.clone()))),
                None => Err(ProviderError::MalformedResponse(format!(
                    "{} has no more scripted responses",
                    self.name
                ))),
            },
        }
    }
}
