//! Thread-safe tool registry and the authorizing dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::{Tool, ToolContext, ToolResult};
use crate::error::OrchestratorError;
use crate::orchestration::bounded::bounded;
use crate::orchestration::types::ToolInvocationRequest;
use crate::runner::{Runner, ToolSpec};

/// A thread-safe registry of tools. Clones share the same map.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    pub async fn register<T: Tool + 'static>(&self, tool: T) {
        self.register_arc(Arc::new(tool)).await;
    }

    /// Register a tool from an Arc. A tool with the same name is replaced.
    pub async fn register_arc(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        if tools.insert(tool.name().to_string(), tool.clone()).is_some() {
            tracing::warn!(tool = %tool.name(), "Replaced an existing tool registration");
        }
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// How the named tool is advertised to a model.
    pub async fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.get(name).await.map(|tool| ToolSpec {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            schema: tool.schema(),
        })
    }

    /// List all tool names, sorted alphabetically.
    pub async fn list(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<_> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools.
    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Authorize and run one tool call on behalf of `caller`.
    ///
    /// A tool outside the caller's permitted set fails with `ToolNotPermitted`
    /// and is never invoked. The call is bounded by `limit` and aborted with
    /// `Cancelled` when `ctx.cancel` fires. Tool failures are surfaced as
    /// `ToolExecutionFailed` carrying the tool's own error.
    pub async fn dispatch(
        &self,
        caller: &Runner,
        request: ToolInvocationRequest,
        ctx: ToolContext,
        limit: Duration,
    ) -> Result<ToolResult, OrchestratorError> {
        let tool_name = request.tool_name;

        if &request.caller != caller.id() || !caller.permits(&tool_name) {
            tracing::warn!(
                runner = %caller.id(),
                agent = %caller.agent().name,
                tool = %tool_name,
                "Tool call refused"
            );
            return Err(OrchestratorError::ToolNotPermitted {
                runner: request.caller,
                tool: tool_name,
            });
        }

        let tool = self
            .get(&tool_name)
            .await
            .ok_or_else(|| OrchestratorError::UnknownTool(tool_name.clone()))?;

        tracing::debug!(runner = %caller.id(), tool = %tool_name, "Dispatching tool call");
        let cancel = ctx.cancel.clone();
        let operation = format!("tool `{tool_name}`");
        let result = bounded(&operation, limit, &cancel, async {
            tool.execute(ctx, request.arguments)
                .await
                .map_err(|cause| OrchestratorError::ToolExecutionFailed {
                    tool: tool_name.clone(),
                    cause,
                })
        })
        .await;

        match &result {
            Ok(_) => tracing::debug!(runner = %caller.id(), tool = %tool_name, "Tool call finished"),
            Err(e) => tracing::info!(runner = %caller.id(), tool = %tool_name, error = %e, "Tool call failed"),
        }
        result
    }
}
