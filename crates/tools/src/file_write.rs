//! File write tool: write or create files with path validation.

use async_trait::async_trait;
use tidewire_core::error::ToolError;
use tidewire_core::tool::{ToolContext, ToolHandler, ToolOutput};

use crate::resolve_path_arg;

pub struct FileWriteTool {
    /// Forbidden path prefixes.
    pub forbidden_paths: Vec<String>,
}

impl FileWriteTool {
    /// Create a file write tool with no path restrictions.
    pub fn new() -> Self {
        Self {
            forbidden_paths: Vec::new(),
        }
    }

    pub fn with_forbidden(forbidden_paths: Vec<String>) -> Self {
        Self { forbidden_paths }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for FileWriteTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn mutates(&self) -> bool {
        true
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

        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason,
        };

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(format!("Failed to create directory: {e}")))?;
        }

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| failed(format!("Failed to write file: {e}")))?;

        tracing::debug!(path = %path.display(), bytes = content.len(), "File written");
        Ok(format!("Successfully wrote {} bytes to {}", content.len(), path.display()).into())
    }
}
