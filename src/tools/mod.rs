//! Tools a runner may invoke, and the dispatcher that authorizes each call.
//!
//! Every tool implements [`Tool`]. The [`registry::ToolRegistry`] maps names to
//! tools and is the only path by which a runner reaches one: a call for a tool
//! outside the caller's permitted set is refused before the tool is touched.

pub mod command;
pub mod delegation;
pub mod registry;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::orchestration::supervisor::Orchestrator;
use crate::orchestration::types::HandleId;

pub use registry::ToolRegistry;

/// A named capability a runner may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the unique name of this tool.
    fn name(&self) -> &str;

    /// Returns a human-readable description for the model.
    fn description(&self) -> &str;

    /// Returns the JSON Schema for the tool's input parameters.
    fn schema(&self) -> serde_json::Value;

    /// Execute the tool. Long-running tools should watch `ctx.cancel`.
    async fn execute(
        &self,
        ctx: ToolContext,
        args: serde_json::Value,
    ) -> Result<ToolResult, anyhow::Error>;
}

/// Per-call context handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    /// The runner making the call.
    pub caller: HandleId,
    /// Cancelled when the caller is terminated.
    pub cancel: CancellationToken,
    orchestrator: Option<Orchestrator>,
}

impl ToolContext {
    pub fn new(caller: HandleId, cancel: CancellationToken, orchestrator: Orchestrator) -> Self {
        Self {
            caller,
            cancel,
            orchestrator: Some(orchestrator),
        }
    }

    /// Context for tools that never reach back into the orchestrator.
    pub fn detached(caller: HandleId, cancel: CancellationToken) -> Self {
        Self {
            caller,
            cancel,
            orchestrator: None,
        }
    }

    pub fn orchestrator(&self) -> anyhow::Result<&Orchestrator> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("tool requires an orchestrator but the call is detached"))
    }
}

/// Successful output of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// The output content.
    pub content: String,
    /// Optional metadata about the execution.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    /// Create a text result.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Create a result whose content is `value` serialized as JSON.
    pub fn json(value: &impl Serialize) -> anyhow::Result<Self> {
        Ok(Self::text(serde_json::to_string(value)?))
    }

    /// Add metadata to the result.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}
