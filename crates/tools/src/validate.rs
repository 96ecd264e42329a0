//! Post-write validation (lint, type-check). Output is advisory: it is
//! appended to the write tool's own result, never sent as its own message.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tidewire_core::CancellationToken;

/// Checks a file after a tool wrote it.
#[async_trait]
pub trait WriteValidator: Send + Sync {
    /// Returns advisory text, or `None` when there is nothing to report.
    async fn validate(&self, path: &Path, cancel: &CancellationToken) -> Option<String>;
}

/// Runs an external command with the written path appended.
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandValidator {
    /// `command` is the program followed by its arguments. Returns `None` for
    /// an empty command.
    pub fn new(command: &[String], working_dir: impl Into<PathBuf>) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WriteValidator for CommandValidator {
    async fn validate(&self, path: &Path, cancel: &CancellationToken) -> Option<String> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(path)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = tokio::time::timeout(self.timeout, command.output()) => result,
        };

        match output {
            Err(_) => Some(format!(
                "Validation: '{}' timed out after {}s",
                self.program,
                self.timeout.as_secs()
            )),
            Ok(Err(e)) => Some(format!("Validation: could not run '{}': {e}", self.program)),
            Ok(Ok(out)) if out.status.success() => None,
            Ok(Ok(out)) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                let text = text.trim();
                Some(if text.is_empty() {
                    format!("Validation: '{}' failed ({})", self.program, out.status)
                } else {
                    format!("Validation issues:\n{text}")
                })
            }
        }
    }
}
