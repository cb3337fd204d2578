//! Builds runners from admitted handles.
//!
//! Everything that can be checked without touching a provider (runner type,
//! tool references) is checked before a session is opened, so a rejected
//! handle never holds an external resource.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::provider::{ProviderSet, SessionResource};
use super::Runner;
use crate::config::ToolName;
use crate::error::OrchestratorError;
use crate::orchestration::cleanup::CleanupCoordinator;
use crate::orchestration::types::RunnerHandle;
use crate::tools::delegation::DELEGATION_TOOLS;
use crate::tools::ToolRegistry;

#[derive(Clone)]
pub struct RunnerGenerator {
    providers: ProviderSet,
    tools: ToolRegistry,
    cleanup: CleanupCoordinator,
}

impl RunnerGenerator {
    pub fn new(providers: ProviderSet, tools: ToolRegistry, cleanup: CleanupCoordinator) -> Self {
        Self {
            providers,
            tools,
            cleanup,
        }
    }

    /// Tools the runner for `handle` may invoke: its configured tools, plus the
    /// delegation tools when it is the root.
    pub fn effective_tools(handle: &RunnerHandle) -> BTreeSet<ToolName> {
        let mut tools = handle.agent.allowed_tools.clone();
        if handle.is_root() {
            tools.extend(DELEGATION_TOOLS.iter().map(|t| t.to_string()));
        }
        tools
    }

    /// Construct the runner for an `Initializing` handle.
    ///
    /// The provider session is attached to the handle's cleanup slot as soon as
    /// it exists, so it is released whichever way the handle ends.
    pub async fn generate(&self, handle: &RunnerHandle) -> Result<Runner, OrchestratorError> {
        let agent = &handle.agent;
        let provider = self
            .providers
            .get(&agent.runner_type)
            .ok_or_else(|| OrchestratorError::UnknownRunnerType(agent.runner_type.clone()))?;

        let mut specs = Vec::new();
        for name in Self::effective_tools(handle) {
            let spec = self
                .tools
                .spec(&name)
                .await
                .ok_or_else(|| OrchestratorError::UnknownTool(name.clone()))?;
            specs.push(spec);
        }

        let session = provider.connect(agent).await?;
        self.cleanup
            .attach(
                &handle.id,
                Box::new(SessionResource::new(handle.id.to_string(), session.clone())),
            )
            .await;

        tracing::info!(
            handle_id = %handle.id,
            agent = %agent.name,
            runner_type = %agent.runner_type,
            tools = specs.len(),
            "Runner generated"
        );

        Ok(Runner::new(
            handle.id.clone(),
            agent.clone(),
            specs,
            session,
            agent.instruction.clone(),
        ))
    }
}
