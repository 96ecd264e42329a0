//! Tool sources beyond the built-in registry.
//!
//! User-defined and plugin tools are plain [`ToolRegistry`]s tagged with
//! their [`SourceKind`], usually filled with [`FunctionTool`]s. Remote
//! protocol servers expose their tools namespaced as `<prefix>__<tool>`
//! and are routed by prefix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tidewire_core::error::ToolError;
use tidewire_core::provider::ToolDefinition;
use tidewire_core::tool::{SourceKind, ToolContext, ToolHandler, ToolOutput, ToolSource};
use tidewire_core::CancellationToken;
use tracing::{debug, info, warn};

/// Separator between a remote server's prefix and its tool name.
pub const REMOTE_SEPARATOR: &str = "__";

type HandlerFn = dyn Fn(serde_json::Value, ToolContext) -> BoxFuture<'static, Result<ToolOutput, ToolError>>
    + Send
    + Sync;

/// A tool backed by an async closure.
pub struct FunctionTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    mutates: bool,
    path_arguments: &'static [&'static str],
    handler: Box<HandlerFn>,
}

impl FunctionTool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value, ToolContext) -> BoxFuture<'static, Result<ToolOutput, ToolError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            mutates: false,
            path_arguments: &[],
            handler: Box::new(handler),
        }
    }

    /// Mark the tool as state-changing.
    pub fn mutating(mut self) -> Self {
        self.mutates = true;
        self
    }

    pub fn with_path_arguments(mut self, keys: &'static [&'static str]) -> Self {
        self.path_arguments = keys;
        self
    }
}

#[async_trait]
impl ToolHandler for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn mutates(&self) -> bool {
        self.mutates
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        self.path_arguments
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        (self.handler)(arguments, ctx.clone()).await
    }
}

// ── Remote protocol ─────────────────────────────────────────────────────

/// A connected remote tool server.
#[async_trait]
pub trait RemoteServer: Send + Sync {
    /// Namespace for this server's tools.
    fn prefix(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError>;

    async fn close(&self);
}

/// Routes `<prefix>__<tool>` names to connected servers.
#[derive(Default)]
pub struct RemoteSource {
    servers: RwLock<HashMap<String, ConnectedServer>>,
}

#[derive(Clone)]
struct ConnectedServer {
    server: Arc<dyn RemoteServer>,
    tools: Vec<ToolDefinition>,
}

impl RemoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server and cache its tool list.
    pub async fn connect(&self, server: Arc<dyn RemoteServer>) -> Result<usize, ToolError> {
        let tools = server.list_tools().await?;
        let count = tools.len();
        let prefix = server.prefix().to_string();
        info!(prefix = %prefix, tools = count, "Remote server connected");
        self.servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(prefix, ConnectedServer { server, tools });
        Ok(count)
    }

    pub fn server_count(&self) -> usize {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        let (prefix, tool) = name.split_once(REMOTE_SEPARATOR)?;
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let connected = servers.get(prefix)?;
        let definition = connected.tools.iter().find(|t| t.name == tool)?;
        Some(Arc::new(RemoteTool {
            exposed_name: name.to_string(),
            definition: definition.clone(),
            server: connected.server.clone(),
        }))
    }
}

#[async_trait]
impl ToolSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.lookup(name)
    }

    async fn definitions(&self) -> Vec<ToolDefinition> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let mut defs: Vec<ToolDefinition> = servers
            .iter()
            .flat_map(|(prefix, connected)| {
                connected.tools.iter().map(move |t| ToolDefinition {
                    name: format!("{prefix}{REMOTE_SEPARATOR}{}", t.name),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn shutdown(&self) {
        let servers: Vec<ConnectedServer> = self
            .servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for connected in servers {
            debug!(prefix = %connected.server.prefix(), "Closing remote server");
            connected.server.close().await;
        }
    }
}

/// One remote tool, exposed under its namespaced name.
struct RemoteTool {
    exposed_name: String,
    definition: ToolDefinition,
    server: Arc<dyn RemoteServer>,
}

#[async_trait]
impl ToolHandler for RemoteTool {
    fn name(&self) -> &str {
        &self.exposed_name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.definition.parameters.clone()
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        self.server
            .call_tool(&self.definition.name, arguments, ctx.cancel.clone())
            .await
            .inspect_err(|e| warn!(tool = %self.exposed_name, error = %e, "Remote call failed"))
    }
}
