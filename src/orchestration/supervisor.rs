//! The orchestrator: the public entry points of the core.
//!
//! [`Orchestrator`] wires the [`ReplicaManager`], the [`RunnerGenerator`] and
//! the [`ToolRegistry`] together. Front ends use `spawn_root`, `send_message`,
//! `snapshot` and `shutdown`; delegation tools use the `*_child` methods on
//! behalf of the runner that called them.
//!
//! A spawned child runs its instruction once as a tokio task. The task, the
//! provider session and the runner's table entry are all attached to the
//! child's cleanup slot, so terminating the handle is enough to release them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::bounded::bounded;
use super::cleanup::{CleanupCoordinator, Releasable, TaskResource};
use super::manager::{RegistryEvent, ReplicaManager};
use super::types::{
    ChildOutcome, HandleId, OutcomeStatus, RunnerHandle, RunnerState, ToolInvocationRequest,
    TransitionOutcome,
};
use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::runner::{LlmProvider, ProviderSet, Runner, RunnerGenerator, ToolInvoker};
use crate::tools::command::register_command_tools;
use crate::tools::delegation::register_delegation_tools;
use crate::tools::{Tool, ToolContext, ToolRegistry, ToolResult};

/// Live runners by handle id, with the outcome of each child's task once it ends.
type RunnerTable = Arc<Mutex<HashMap<HandleId, LiveRunner>>>;

struct LiveRunner {
    runner: Arc<Runner>,
    outcome: Option<ChildOutcome>,
}

struct Inner {
    config: AppConfig,
    manager: ReplicaManager,
    generator: RunnerGenerator,
    tools: ToolRegistry,
    runners: RunnerTable,
}

/// Cheap to clone; all clones drive the same runner tree.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    providers: ProviderSet,
    tools: Vec<Arc<dyn Tool>>,
    events: Option<UnboundedSender<RegistryEvent>>,
    workspace: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            providers: ProviderSet::with_defaults(),
            tools: Vec::new(),
            events: None,
            workspace: None,
        }
    }

    /// Replace the provider set.
    pub fn providers(mut self, providers: ProviderSet) -> Self {
        self.providers = providers;
        self
    }

    /// Add (or override) a single provider.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    /// Register an extra in-process tool.
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn events(mut self, tx: UnboundedSender<RegistryEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Working directory for command-backed tools. Defaults to the current directory.
    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace = Some(path.into());
        self
    }

    pub async fn build(self) -> Orchestrator {
        let tools = ToolRegistry::new();
        let workspace = self.workspace.unwrap_or_else(|| PathBuf::from("."));
        register_command_tools(&tools, &self.config, workspace).await;
        for tool in self.tools {
            tools.register_arc(tool).await;
        }
        // Last, so nothing can shadow a delegation tool.
        register_delegation_tools(&tools).await;

        let cleanup = CleanupCoordinator::new();
        let mut manager = ReplicaManager::new(self.config.runtime, cleanup.clone());
        if let Some(tx) = self.events {
            manager = manager.with_events(tx);
        }
        let generator = RunnerGenerator::new(self.providers, tools.clone(), cleanup);

        tracing::debug!(tools = tools.count().await, "Orchestrator ready");
        Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                manager,
                generator,
                tools,
                runners: Arc::default(),
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder(config: AppConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &ReplicaManager {
        &self.inner.manager
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    fn limit(&self) -> Duration {
        self.inner.config.runtime.default_timeout()
    }

    /// Generate the root runner from the main agent and leave it `Running`.
    pub async fn spawn_root(&self) -> Result<HandleId, OrchestratorError> {
        let agent = self
            .inner
            .config
            .main_agent()
            .ok_or_else(|| OrchestratorError::UnknownAgent("<main>".into()))?;
        let handle = self.inner.manager.register_root(agent)?;
        self.start(&handle, "root start-up").await?;
        self.inner.manager.mark_running(&handle.id)?;
        Ok(handle.id)
    }

    /// Send a user message to the root runner and return its answer.
    pub async fn send_message(&self, text: &str) -> Result<String, OrchestratorError> {
        let root = self.inner.manager.root().ok_or(OrchestratorError::NoRoot)?;
        let (runner, cancel) = self.live_runner(&root)?;
        self.converse(&runner, text, &cancel).await
    }

    /// Dispatch a tool call as if `request.caller` had made it.
    pub async fn call_tool(
        &self,
        request: ToolInvocationRequest,
    ) -> Result<ToolResult, OrchestratorError> {
        let (runner, cancel) = self.live_runner(&request.caller)?;
        self.dispatcher(cancel).invoke(&runner, request).await
    }

    /// Admit, generate and start a child of `parent` running `instruction`.
    ///
    /// Returns once the child is `Ready` and its task is started. If generation
    /// fails or times out, the reserved slot is released before returning.
    pub async fn spawn_child(
        &self,
        parent: &HandleId,
        agent_name: &str,
        instruction: String,
    ) -> Result<HandleId, OrchestratorError> {
        let agent = self
            .inner
            .config
            .agent(agent_name)
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_name.to_string()))?;
        let handle = self.inner.manager.request_spawn(parent, agent)?;

        // Start-up runs on its own task so the slot is released even if this
        // future is dropped before start-up finishes.
        let launch = tokio::spawn(self.clone().launch(handle, instruction));
        match launch.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(OrchestratorError::Cancelled),
        }
    }

    /// Send a follow-up message to a live descendant of `caller`.
    pub async fn ask_child(
        &self,
        caller: &HandleId,
        child: &HandleId,
        message: &str,
    ) -> Result<String, OrchestratorError> {
        let handle = self.descendant(caller, child)?;
        if !matches!(
            handle.state,
            RunnerState::Ready | RunnerState::Running | RunnerState::Completed
        ) {
            return Err(OrchestratorError::NotRunning {
                id: child.clone(),
                state: handle.state,
            });
        }

        let (runner, cancel) = self.live_runner(child)?;
        bounded("ask", self.limit(), &cancel, self.converse(&runner, message, &cancel)).await
    }

    /// The recorded outcome of a descendant's task, `None` while it is working.
    pub fn child_outcome(
        &self,
        caller: &HandleId,
        child: &HandleId,
    ) -> Result<Option<ChildOutcome>, OrchestratorError> {
        self.descendant(caller, child)?;
        let runners = self.inner.runners.lock().unwrap();
        Ok(runners.get(child).and_then(|r| r.outcome.clone()))
    }

    /// Terminate a descendant of `caller` and its whole subtree.
    pub async fn kill_child(
        &self,
        caller: &HandleId,
        child: &HandleId,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        self.descendant(caller, child)?;
        self.inner.manager.terminate(child, true).await
    }

    /// Direct live children of `caller`, oldest first.
    pub fn list_children(&self, caller: &HandleId) -> Vec<RunnerHandle> {
        self.inner.manager.children_of(caller)
    }

    pub fn snapshot(&self) -> Vec<RunnerHandle> {
        self.inner.manager.snapshot()
    }

    pub fn runner(&self, id: &HandleId) -> Option<Arc<Runner>> {
        let runners = self.inner.runners.lock().unwrap();
        runners.get(id).map(|r| r.runner.clone())
    }

    /// Cancel everything and terminate the whole tree.
    pub async fn shutdown(&self) {
        tracing::info!(live = self.snapshot().len(), "Shutting down runner tree");
        self.inner.manager.shutdown_all().await;
    }

    /// Start an admitted child and hand its instruction to a fresh task.
    async fn launch(self, handle: RunnerHandle, instruction: String) -> Result<HandleId, OrchestratorError> {
        let runner = self.start(&handle, "child start-up").await?;

        let Some(cancel) = self.inner.manager.cancel_token(&handle.id) else {
            return Err(OrchestratorError::Cancelled);
        };
        let task = tokio::spawn(self.clone().run_child(runner, instruction, cancel));
        self.inner
            .manager
            .cleanup()
            .attach(&handle.id, Box::new(TaskResource::new(handle.id.to_string(), task)))
            .await;

        Ok(handle.id)
    }

    /// Generate the runner for an `Initializing` handle and mark it `Ready`.
    async fn start(
        &self,
        handle: &RunnerHandle,
        operation: &str,
    ) -> Result<Arc<Runner>, OrchestratorError> {
        let manager = &self.inner.manager;
        let Some(cancel) = manager.cancel_token(&handle.id) else {
            return Err(OrchestratorError::Cancelled);
        };

        let generated = bounded(
            operation,
            self.limit(),
            &cancel,
            self.inner.generator.generate(handle),
        )
        .await;
        let runner = match generated {
            Ok(runner) => Arc::new(runner),
            Err(e) => {
                self.abandon(&handle.id, &e).await;
                return Err(e);
            }
        };

        self.install(runner.clone()).await;
        if let Err(e) = manager.mark_ready(&handle.id) {
            self.abandon(&handle.id, &e).await;
            return Err(e);
        }
        Ok(runner)
    }

    /// Fail a handle that never got going and give its slot back.
    async fn abandon(&self, id: &HandleId, cause: &OrchestratorError) {
        tracing::warn!(handle_id = %id, error = %cause, "Runner failed to start");
        let _ = self.inner.manager.mark_failed(id, cause.to_string());
        if let Err(e) = self.inner.manager.terminate(id, true).await {
            tracing::warn!(handle_id = %id, error = %e, "Could not release abandoned runner");
        }
    }

    async fn install(&self, runner: Arc<Runner>) {
        let id = runner.id().clone();
        self.inner.runners.lock().unwrap().insert(
            id.clone(),
            LiveRunner {
                runner,
                outcome: None,
            },
        );
        let entry = RunnerEntry {
            table: self.inner.runners.clone(),
            id: id.clone(),
        };
        self.inner.manager.cleanup().attach(&id, Box::new(entry)).await;
    }

    /// The body of a child's task: run the instruction once and record how it went.
    async fn run_child(self, runner: Arc<Runner>, instruction: String, cancel: CancellationToken) {
        let id = runner.id().clone();
        let manager = &self.inner.manager;
        if let Err(e) = manager.mark_running(&id) {
            tracing::debug!(handle_id = %id, error = %e, "Child stopped before running");
            return;
        }

        let started = Instant::now();
        let result = self.converse(&runner, &instruction, &cancel).await;
        if cancel.is_cancelled() {
            tracing::debug!(handle_id = %id, "Child cancelled mid-task");
            return;
        }

        let (status, output) = match &result {
            Ok(text) => (OutcomeStatus::Completed, text.clone()),
            Err(e) => (OutcomeStatus::Failed, e.to_string()),
        };
        if let Some(entry) = self.inner.runners.lock().unwrap().get_mut(&id) {
            entry.outcome = Some(ChildOutcome {
                agent_id: id.clone(),
                status,
                output,
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        let transition = match result {
            Ok(_) => manager.mark_completed(&id),
            Err(e) => {
                tracing::info!(handle_id = %id, error = %e, "Child task failed");
                let failed = manager.mark_failed(&id, e.to_string());
                // A failed child's own children have nobody left to report to.
                for descendant in manager.children_of(&id) {
                    if let Err(e) = manager.terminate(&descendant.id, true).await {
                        tracing::warn!(handle_id = %descendant.id, error = %e, "Cascade after failure");
                    }
                }
                failed
            }
        };
        if let Err(e) = transition {
            tracing::debug!(handle_id = %id, error = %e, "Child finished after termination began");
        }
    }

    async fn converse(
        &self,
        runner: &Runner,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let dispatcher = self.dispatcher(cancel.clone());
        runner.converse(message, &dispatcher, self.limit(), cancel).await
    }

    fn dispatcher(&self, cancel: CancellationToken) -> Dispatcher {
        Dispatcher {
            orchestrator: self.clone(),
            cancel,
        }
    }

    fn live_runner(&self, id: &HandleId) -> Result<(Arc<Runner>, CancellationToken), OrchestratorError> {
        let runner = self
            .runner(id)
            .ok_or_else(|| OrchestratorError::UnknownHandle(id.clone()))?;
        let cancel = self
            .inner
            .manager
            .cancel_token(id)
            .ok_or_else(|| OrchestratorError::UnknownHandle(id.clone()))?;
        Ok((runner, cancel))
    }

    /// `child` as seen by `caller`. Anything outside the caller's subtree is unknown to it.
    fn descendant(&self, caller: &HandleId, child: &HandleId) -> Result<RunnerHandle, OrchestratorError> {
        if !self.inner.manager.is_ancestor(caller, child) {
            return Err(OrchestratorError::UnknownHandle(child.clone()));
        }
        self.inner
            .manager
            .get(child)
            .ok_or_else(|| OrchestratorError::UnknownHandle(child.clone()))
    }
}

/// Routes a runner's tool calls through the registry with the runner's
/// cancellation token.
struct Dispatcher {
    orchestrator: Orchestrator,
    cancel: CancellationToken,
}

#[async_trait]
impl ToolInvoker for Dispatcher {
    async fn invoke(
        &self,
        caller: &Runner,
        request: ToolInvocationRequest,
    ) -> Result<ToolResult, OrchestratorError> {
        let ctx = ToolContext::new(
            caller.id().clone(),
            self.cancel.clone(),
            self.orchestrator.clone(),
        );
        self.orchestrator
            .inner
            .tools
            .dispatch(caller, request, ctx, self.orchestrator.limit())
            .await
    }
}

/// Removes a runner (and its recorded outcome) from the table on cleanup.
struct RunnerEntry {
    table: RunnerTable,
    id: HandleId,
}

#[async_trait]
impl Releasable for RunnerEntry {
    fn describe(&self) -> String {
        format!("runner:{}", self.id)
    }

    async fn release(&self) {
        self.table.lock().unwrap().remove(&self.id);
    }
}
