//! Tool traits: the abstraction over agent capabilities.
//!
//! A [`ToolHandler`] is one callable tool. Handlers are grouped into
//! [`ToolSource`]s (built-in, user-defined, plugin, remote-protocol); the
//! executor walks the sources in that order when resolving a name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::message::{Message, Role};
use crate::provider::ToolDefinition;

/// Prefix that marks a tool result as a failure.
pub const ERROR_PREFIX: &str = "Error:";

/// What a handler hands back: plain text or a structured object.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(serde_json::Value),
}

impl ToolOutput {
    /// Render as the `content` string of a tool result.
    pub fn into_content(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Json(serde_json::Value::String(s)) => s,
            Self::Json(value) => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

impl From<String> for ToolOutput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ToolOutput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<serde_json::Value> for ToolOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    /// Relative paths resolve against this directory.
    pub workspace_root: PathBuf,
    /// Fires when the owning request or task is cancelled.
    pub cancel: CancellationToken,
}

/// The outcome of one tool call, appended to history as a `tool` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Always [`Role::Tool`]
    pub role: Role,
    pub tool_call_id: String,
    pub name: String,
    /// Prefixed with `"Error:"` when the call failed
    pub content: String,
}

impl ToolResult {
    pub fn success(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn error(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::success(tool_call_id, name, format!("{ERROR_PREFIX} {message}"))
    }

    pub fn is_error(&self) -> bool {
        self.content.starts_with(ERROR_PREFIX)
    }

    pub fn into_message(self) -> Message {
        Message::tool_result(self.tool_call_id, self.name, self.content)
    }
}

/// One callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether the tool changes state. Mutating tools are swapped for
    /// recorders in dry-run mode and their writes may be validated.
    fn mutates(&self) -> bool {
        false
    }

    /// Argument keys that hold filesystem paths this tool touches.
    fn path_arguments(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute the tool with already-parsed arguments.
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Where a handler came from. Also the dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Builtin,
    Custom,
    Plugin,
    Remote,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Builtin => "builtin",
            Self::Custom => "custom",
            Self::Plugin => "plugin",
            Self::Remote => "remote",
        })
    }
}

/// A group of tools with a common origin.
#[async_trait]
pub trait ToolSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Look a tool up by its exposed name.
    async fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>>;

    /// Definitions of every tool this source exposes.
    async fn definitions(&self) -> Vec<ToolDefinition>;

    /// Release connections or plugin state.
    async fn shutdown(&self) {}
}

/// A name-keyed set of local handlers. Used for built-in, custom and plugin tools.
pub struct ToolRegistry {
    kind: SourceKind,
    tools: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&self, tool: Arc<dyn ToolHandler>) {
        let name = tool.name().to_string();
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, tool);
    }

    /// Remove a tool. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ToolSource for ToolRegistry {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.get(name)
    }

    async fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut defs: Vec<ToolDefinition> = tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}
