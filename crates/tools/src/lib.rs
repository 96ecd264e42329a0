//! Tool dispatch for Tidewire.
//!
//! The [`ToolExecutor`] resolves a call against its sources (built-in,
//! user-defined, plugin, remote) and runs it under a timeout and the
//! request's cancellation token. Paths outside the workspace go through the
//! [`ConfirmationGate`]; in dry-run mode mutating tools only record what they
//! would have done.

pub mod confirmation;
pub mod dry_run;
pub mod executor;
pub mod file_read;
pub mod file_write;
pub mod list_dir;
pub mod sources;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use tidewire_core::error::ToolError;
use tidewire_core::tool::{SourceKind, ToolContext, ToolRegistry};

pub use confirmation::{ConfirmationGate, ConfirmationRequest, Decision};
pub use dry_run::{DryRunRecorder, PlannedChange};
pub use executor::{ExecutorConfig, ToolExecutor};
pub use sources::{FunctionTool, REMOTE_SEPARATOR, RemoteServer, RemoteSource};
pub use validate::{CommandValidator, WriteValidator};

/// Create the built-in registry: file read, file write and directory listing.
///
/// `forbidden_paths` are blocked for every tool regardless of confirmation.
pub fn default_registry(forbidden_paths: &[String]) -> ToolRegistry {
    let registry = ToolRegistry::new(SourceKind::Builtin);
    registry.register(Arc::new(file_read::FileReadTool::with_forbidden(
        forbidden_paths.to_vec(),
    )));
    registry.register(Arc::new(file_write::FileWriteTool::with_forbidden(
        forbidden_paths.to_vec(),
    )));
    registry.register(Arc::new(list_dir::ListDirTool::with_forbidden(
        forbidden_paths.to_vec(),
    )));
    registry
}

/// Resolve a path argument against the workspace root and reject forbidden
/// locations.
pub(crate) fn resolve_path_arg(
    arguments: &serde_json::Value,
    key: &str,
    ctx: &ToolContext,
    forbidden: &[String],
    tool_name: &str,
) -> Result<PathBuf, ToolError> {
    let raw = arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))?;

    let path = tidewire_security::resolve_tool_path(raw, &ctx.workspace_root).map_err(|e| {
        ToolError::InvalidArguments(e.to_string())
    })?;

    tidewire_security::check_forbidden(&path, forbidden).map_err(|e| {
        ToolError::PermissionDenied {
            tool_name: tool_name.to_string(),
            reason: e.to_string(),
        }
    })?;

    Ok(path)
}

#[cfg(test)]
pub(crate) fn test_context(root: &std::path::Path) -> ToolContext {
    ToolContext {
        call_id: "call_test".into(),
        tool_name: "test".into(),
        workspace_root: root.to_path_buf(),
        cancel: tidewire_core::CancellationToken::new(),
    }
}
