//! Security module for tidewire: path resolution and workspace sandboxing.
//!
//! Provides:
//! - **Path resolution**: tool path arguments resolved against a workspace
//!   root with symlinks followed, plus a forbidden-path check for file tools
//! - **Workspace policy**: the deny-list applied to workspace-task roots

pub mod path;
pub mod workspace;

pub use path::{
    PathValidationError, check_forbidden, expand_tilde, is_within_root, normalize_lexically,
    resolve_symlinks, resolve_tool_path,
};
pub use workspace::WorkspacePolicy;
