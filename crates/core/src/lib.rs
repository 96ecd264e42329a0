//! # tidewire core
//!
//! Domain types, traits, and error definitions for the tidewire orchestration
//! runtime. Every collaborator the pipeline talks to (LLM adapter, history
//! store, tool handlers, event bus) is defined here as a trait or value type;
//! implementations live in their own crates.
//!
//! ## Design Philosophy
//!
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod model;
pub mod provider;
pub mod request;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, HistoryError, ProviderError, Result, TaskError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use history::{FileHistory, HistoryStore, InMemoryHistory};
pub use message::{FunctionCall, Message, Role, ToolCall};
pub use model::{ModelConfig, ReasoningEffort, TaskRole};
pub use provider::{
    AssistantMessage, Choice, GenerateRequest, GenerateResponse, Provider, ToolDefinition, Usage,
};
pub use request::{RequestContext, RequestMetadata, StageError};
pub use tool::{
    SourceKind, ToolContext, ToolHandler, ToolOutput, ToolRegistry, ToolResult, ToolSource,
};

/// Cancellation handle threaded through every async boundary.
pub use tokio_util::sync::CancellationToken;
