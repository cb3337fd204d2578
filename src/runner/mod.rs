//! Runners: a live provider session bound to one handle.
//!
//! A runner owns its conversation. Each message runs model turns until the
//! model answers without requesting tools; every requested tool call goes out
//! through a [`ToolInvoker`], which is where authorization happens.

pub mod generator;
pub mod provider;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, ToolName};
use crate::error::{OrchestratorError, ProviderError};
use crate::orchestration::bounded::bounded;
use crate::orchestration::types::{HandleId, ToolInvocationRequest};
use crate::tools::delegation::DELEGATION_TOOLS;
use crate::tools::ToolResult;

pub use generator::RunnerGenerator;
pub use provider::{LlmProvider, ProviderSession, ProviderSet, Reply, RequestedCall, ToolSpec, Turn};

/// Upper bound on model turns spent on tool calls for one message.
pub const MAX_TOOL_ROUNDS: usize = 16;

/// Routes a runner's tool calls.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        caller: &Runner,
        request: ToolInvocationRequest,
    ) -> Result<ToolResult, OrchestratorError>;
}

/// An executable agent instance. Produced by [`RunnerGenerator`]; its
/// lifecycle is owned by the handle with the same id.
pub struct Runner {
    id: HandleId,
    agent: Arc<AgentConfig>,
    instruction: Option<String>,
    tools: BTreeSet<ToolName>,
    specs: Vec<ToolSpec>,
    session: Arc<dyn ProviderSession>,
    transcript: tokio::sync::Mutex<Vec<Turn>>,
}

impl Runner {
    pub fn new(
        id: HandleId,
        agent: Arc<AgentConfig>,
        specs: Vec<ToolSpec>,
        session: Arc<dyn ProviderSession>,
        instruction: Option<String>,
    ) -> Self {
        Self {
            id,
            agent,
            instruction,
            tools: specs.iter().map(|s| s.name.clone()).collect(),
            specs,
            session,
            transcript: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &HandleId {
        &self.id
    }

    pub fn agent(&self) -> &Arc<AgentConfig> {
        &self.agent
    }

    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// The effective tool set this runner may invoke.
    pub fn tools(&self) -> &BTreeSet<ToolName> {
        &self.tools
    }

    pub fn permits(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }

    /// Whether any delegation tool is in the effective set.
    pub fn can_delegate(&self) -> bool {
        DELEGATION_TOOLS.iter().any(|t| self.tools.contains(*t))
    }

    /// Handle one message and return the model's final answer.
    ///
    /// Each model turn is bounded by `limit`; the whole exchange stops with
    /// `Cancelled` as soon as `cancel` fires. Tool failures other than
    /// cancellation are reported back to the model as text. The conversation
    /// is only extended when the exchange succeeds.
    pub async fn converse(
        &self,
        message: &str,
        invoker: &dyn ToolInvoker,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let mut transcript = self.transcript.lock().await;
        let mut working = transcript.clone();
        working.push(Turn::User(message.to_string()));

        for round in 0..MAX_TOOL_ROUNDS {
            let reply = bounded("model turn", limit, cancel, async {
                self.session
                    .complete(self.instruction(), &working, &self.specs)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await?;

            if reply.calls.is_empty() {
                let text = reply.text.ok_or(ProviderError::EmptyResponse)?;
                working.push(Turn::Assistant(text.clone()));
                *transcript = working;
                return Ok(text);
            }

            tracing::debug!(runner = %self.id, round, calls = reply.calls.len(), "Model requested tools");
            working.push(Turn::ToolCalls(reply.calls.clone()));
            for call in reply.calls {
                let request = ToolInvocationRequest::new(self.id.clone(), &call.name, call.arguments);
                let content = match invoker.invoke(self, request).await {
                    Ok(result) => result.content,
                    Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                    Err(e) => format!("error: {e}"),
                };
                working.push(Turn::ToolResult {
                    call_id: call.call_id,
                    content,
                });
            }
        }

        Err(ProviderError::Request(format!(
            "no final answer after {MAX_TOOL_ROUNDS} tool rounds"
        ))
        .into())
    }

    /// Number of turns in the committed conversation.
    pub async fn transcript_len(&self) -> usize {
        self.transcript.lock().await.len()
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("agent", &self.agent.name)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}
