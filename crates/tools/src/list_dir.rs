//! Directory listing tool.

use async_trait::async_trait;
use tidewire_core::error::ToolError;
use tidewire_core::tool::{ToolContext, ToolHandler, ToolOutput};

use crate::resolve_path_arg;

/// Entries beyond this are summarised rather than listed.
const MAX_ENTRIES: usize = 500;

#[derive(Default)]
pub struct ListDirTool {
    pub forbidden_paths: Vec<String>,
}

impl ListDirTool {
    pub fn with_forbidden(forbidden_paths: Vec<String>) -> Self {
        Self { forbidden_paths }
    }
}

#[async_trait]
impl ToolHandler for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are shown with a trailing '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (defaults to the workspace root)"
                }
            }
        })
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["path"]
    }

    async fn invoke(
        &self,
        mut arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        if arguments.get("path").and_then(|p| p.as_str()).is_none() {
            arguments["path"] = serde_json::json!(".");
        }
        let path = resolve_path_arg(&arguments, "path", ctx, &self.forbidden_paths, self.name())?;

        let failed = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: "list_dir".into(),
            reason: format!("Failed to list {}: {e}", path.display()),
        };

        let mut reader = tokio::fs::read_dir(&path).await.map_err(failed)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(failed)? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        let total = entries.len();
        if total == 0 {
            return Ok("(empty directory)".into());
        }
        let mut out = entries
            .into_iter()
            .take(MAX_ENTRIES)
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_ENTRIES {
            out.push_str(&format!("\n... and {} more", total - MAX_ENTRIES));
        }
        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_context;

    #[tokio::test]
    async fn lists_sorted_with_dir_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let out = ListDirTool::default()
            .invoke(serde_json::json!({}), &test_context(dir.path()))
            .await
            .unwrap()
            .into_content();
        assert_eq!(out, "a/\nb.txt");
    }

    #[tokio::test]
    async fn empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = ListDirTool::default()
            .invoke(serde_json::json!({"path": "."}), &test_context(dir.path()))
            .await
            .unwrap()
            .into_content();
        assert_eq!(out, "(empty directory)");
    }
}
