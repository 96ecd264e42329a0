//! Workspace-root deny-list: decides whether a directory may host an
//! isolated workspace task.
//!
//! Two lists apply: protected system paths (matched exactly or as a prefix)
//! and sensitive subdirectories of the home directory. Symlinks are resolved
//! before matching, including ones pointing at paths that do not exist yet.

use std::path::{Path, PathBuf};

use tidewire_config::TasksConfig;

use crate::path::{expand_tilde, home_dir, resolve_symlinks, PathValidationError};

/// Deny-list for workspace roots.
#[derive(Debug, Clone)]
pub struct WorkspacePolicy {
    /// Roots may not be these paths or lie beneath them
    protected_prefixes: Vec<String>,
    /// Roots may not be exactly these paths
    protected_exact: Vec<String>,
    /// Relative to the home directory
    sensitive_home_dirs: Vec<String>,
    home: Option<PathBuf>,
}

impl WorkspacePolicy {
    pub fn new(
        protected_prefixes: Vec<String>,
        protected_exact: Vec<String>,
        sensitive_home_dirs: Vec<String>,
    ) -> Self {
        Self {
            protected_prefixes,
            protected_exact,
            sensitive_home_dirs,
            home: home_dir(),
        }
    }

    pub fn from_config(config: &TasksConfig) -> Self {
        Self::new(
            config.protected_paths.clone(),
            config.protected_exact_paths.clone(),
            config.sensitive_home_dirs.clone(),
        )
    }

    /// Override the home directory used for `~` rules.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Validate a candidate workspace root and return its resolved form.
    ///
    /// Never touches the filesystem beyond reading metadata and links.
    pub fn check(&self, raw: &str) -> Result<PathBuf, PathValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PathValidationError::Empty);
        }
        let expanded = self.expand(raw);
        if !expanded.is_absolute() {
            return Err(PathValidationError::NotAbsolute { path: raw.into() });
        }

        // The literal path and its resolution must both pass.
        let resolved = resolve_symlinks(&expanded);
        for candidate in [&expanded, &resolved] {
            self.check_resolved(raw, candidate)?;
        }

        tracing::debug!(path = %resolved.display(), "Workspace root accepted");
        Ok(resolved)
    }

    fn check_resolved(&self, raw: &str, path: &Path) -> Result<(), PathValidationError> {
        for exact in &self.protected_exact {
            if self.rule_matches(exact, |rule| path == rule) {
                return Err(PathValidationError::ProtectedSystemPath {
                    path: raw.into(),
                    pattern: exact.clone(),
                });
            }
        }

        for prefix in &self.protected_prefixes {
            if self.rule_matches(prefix, |rule| path.starts_with(rule)) {
                return Err(PathValidationError::ProtectedSystemPath {
                    path: raw.into(),
                    pattern: prefix.clone(),
                });
            }
        }

        if let Some(home) = &self.home {
            for dir in &self.sensitive_home_dirs {
                let literal = home.join(dir);
                let resolved = resolve_symlinks(&literal);
                if path.starts_with(&literal) || path.starts_with(&resolved) {
                    return Err(PathValidationError::SensitiveHomeDir {
                        path: raw.into(),
                        dir: format!("~/{dir}"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Match a rule in both its literal and symlink-resolved forms
    /// (`/etc` is `/private/etc` on some systems).
    fn rule_matches(&self, rule: &str, test: impl Fn(&Path) -> bool) -> bool {
        let literal = self.expand(rule);
        test(&literal) || test(&resolve_symlinks(&literal))
    }

    fn expand(&self, raw: &str) -> PathBuf {
        match (&self.home, raw) {
            (Some(home), "~") => home.clone(),
            (Some(home), _) if raw.starts_with("~/") => home.join(&raw[2..]),
            _ => expand_tilde(raw),
        }
    }
}

impl Default for WorkspacePolicy {
    fn default() -> Self {
        Self::from_config(&TasksConfig::default())
    }
}
