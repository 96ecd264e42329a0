//! Path resolution: turning tool and workspace paths into absolute,
//! symlink-resolved paths that can be compared against roots and deny-lists.
//!
//! All comparisons are component-wise (`Path::starts_with`), so `/etcetera`
//! never matches a rule for `/etc`.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Symlink hops followed before giving up on a chain.
const MAX_SYMLINK_HOPS: usize = 16;

/// Error returned when path validation fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' matches forbidden pattern '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Path '{path}' is a protected system location ('{pattern}')")]
    ProtectedSystemPath { path: String, pattern: String },

    #[error("Path '{path}' is inside the sensitive home directory '{dir}'")]
    SensitiveHomeDir { path: String, dir: String },

    #[error("Path '{path}' must be absolute")]
    NotAbsolute { path: String },

    #[error("Path is empty")]
    Empty,
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(home) = home_dir() {
        if path == "~" {
            return home;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// The user's home directory, if known.
pub fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

/// Resolve `.` and `..` without touching the filesystem. `..` never climbs
/// above the root of an absolute path.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve every symlink along `path`, including ones whose final target
/// does not exist yet.
///
/// The deepest existing ancestor is canonicalized and the missing tail is
/// appended. A dangling symlink is followed through its link text, so a
/// not-yet-created target is still judged by where it points.
pub fn resolve_symlinks(path: &Path) -> PathBuf {
    resolve_with_hops(&normalize_lexically(path), 0)
}

fn resolve_with_hops(path: &Path, hops: usize) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();

    loop {
        if let Ok(meta) = std::fs::symlink_metadata(&existing) {
            let dangling = meta.file_type().is_symlink() && std::fs::metadata(&existing).is_err();
            let mut resolved = if dangling && hops < MAX_SYMLINK_HOPS {
                match std::fs::read_link(&existing) {
                    Ok(target) => {
                        let parent = existing.parent().map(Path::to_path_buf).unwrap_or_default();
                        let target = if target.is_absolute() {
                            target
                        } else {
                            parent.join(target)
                        };
                        resolve_with_hops(&normalize_lexically(&target), hops + 1)
                    }
                    Err(_) => existing.clone(),
                }
            } else {
                existing.canonicalize().unwrap_or_else(|_| existing.clone())
            };
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return normalize_lexically(&resolved);
        }

        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolve a path argument from a tool call: `~` expanded, relative paths
/// joined onto `root`, symlinks resolved.
pub fn resolve_tool_path(raw: &str, root: &Path) -> Result<PathBuf, PathValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PathValidationError::Empty);
    }
    let expanded = expand_tilde(raw);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };
    Ok(resolve_symlinks(&joined))
}

/// Whether `path` is `root` or lies beneath it. Both sides are resolved first.
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    resolve_symlinks(path).starts_with(resolve_symlinks(root))
}

/// Reject `path` if it sits at or beneath any forbidden pattern (`~` allowed).
pub fn check_forbidden(path: &Path, forbidden: &[String]) -> Result<(), PathValidationError> {
    let resolved = resolve_symlinks(path);
    for pattern in forbidden {
        let rule = resolve_symlinks(&expand_tilde(pattern));
        if resolved.starts_with(&rule) {
            return Err(PathValidationError::ForbiddenPath {
                path: path.display().to_string(),
                pattern: pattern.clone(),
            });
        }
    }
    Ok(())
}
