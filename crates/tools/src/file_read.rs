//! File read tool: read file contents with path validation.

use async_trait::async_trait;
use tidewire_core::error::ToolError;
use tidewire_core::tool::{ToolContext, ToolHandler, ToolOutput};

use crate::resolve_path_arg;

/// Files larger than this are truncated in the tool result.
const MAX_READ_BYTES: usize = 256 * 1024;

pub struct FileReadTool {
    /// Forbidden path prefixes.
    pub forbidden_paths: Vec<String>,
}

impl FileReadTool {
    /// Create a file read tool with no path restrictions.
    pub fn new() -> Self {
        Self {
            forbidden_paths: Vec::new(),
        }
    }

    pub fn with_forbidden(forbidden_paths: Vec<String>) -> Self {
        Self { forbidden_paths }
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for FileReadTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Relative paths are resolved against the workspace root."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                }
            },
            "required": ["path"]
        })
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["path"]
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = resolve_path_arg(&arguments, "path", ctx, &self.forbidden_paths, self.name())?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: format!("Failed to read {}: {e}", path.display()),
            })?;

        if content.len() > MAX_READ_BYTES {
            let mut cut = MAX_READ_BYTES;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            return Ok(format!(
                "{}\n\n[truncated: {} of {} bytes shown]",
                &content[..cut],
                cut,
                content.len()
            )
            .into());
        }

        Ok(content.into())
    }
}
