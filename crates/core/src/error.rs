//! Error types for the tidewire domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all tidewire operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- History errors ---
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    // --- Task errors ---
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The endpoint could not be reached at all (connection refused, DNS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The endpoint answered but the body was not a usable completion.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transport failures are recoverable by the agent loop; everything else
    /// ends the turn with an error reply.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Remote server unavailable: {0}")]
    RemoteUnavailable(String),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to persist history to {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("Failed to load history from {path}: {reason}")]
    Load { path: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("Workspace path '{path}' is not allowed: {reason}")]
    ForbiddenWorkspace { path: String, reason: String },

    #[error("Failed to prepare workspace '{path}': {reason}")]
    WorkspaceCreation { path: String, reason: String },

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Timed out after {waited_ms}ms waiting for task {id}")]
    WaitTimeout { id: String, waited_ms: u64 },

    #[error("No engine factory configured for {0} tasks")]
    EngineUnavailable(String),

    #[error("Failed to start engine: {0}")]
    EngineStart(String),

    #[error("Invalid schedule '{name}': {reason}")]
    InvalidSchedule { name: String, reason: String },
}
