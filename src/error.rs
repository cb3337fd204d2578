use std::path::PathBuf;

use crate::orchestration::types::{HandleId, RunnerState};

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by an LLM provider client.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API key environment variable `{0}` is not set")]
    MissingApiKey(String),

    #[error("Provider `{provider}` could not open a session: {message}")]
    ConnectFailed { provider: String, message: String },

    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,
}

/// Errors related to shell command execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn shell process: {0}")]
    SpawnFailed(String),

    #[error("Process execution failed: {0}")]
    ProcessFailed(String),
}

/// The orchestration core's error taxonomy.
///
/// Admission and validation errors are returned to the caller as-is and never
/// retried by the core.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Unknown or non-live parent runner: {0}")]
    UnknownParent(HandleId),

    #[error("Recursion depth exceeded ({depth} > {max})")]
    DepthExceeded { depth: usize, max: usize },

    #[error("Global child limit reached ({max})")]
    GlobalLimitExceeded { max: usize },

    #[error("Runner {0} is not recursible and already has a child")]
    NotRecursible(HandleId),

    #[error("Runner {parent} reached its child limit ({max})")]
    ChildLimitExceeded { parent: HandleId, max: usize },

    #[error("Invalid transition for runner {id}: {from} -> {to}")]
    InvalidTransition {
        id: HandleId,
        from: RunnerState,
        to: RunnerState,
    },

    #[error("Unknown runner type: {0}")]
    UnknownRunnerType(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown agent configuration: {0}")]
    UnknownAgent(String),

    #[error("Tool `{tool}` is not permitted for runner {runner}")]
    ToolNotPermitted { runner: HandleId, tool: String },

    #[error("Tool `{tool}` failed: {cause:#}")]
    ToolExecutionFailed {
        tool: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A root runner is already live: {0}")]
    RootAlreadyExists(HandleId),

    #[error("No root runner has been spawned")]
    NoRoot,

    #[error("The runner tree has been shut down")]
    ShutDown,

    #[error("Runner {0} still has live children; terminate with cascade")]
    HasLiveChildren(HandleId),

    #[error("Unknown runner handle: {0}")]
    UnknownHandle(HandleId),

    #[error("Runner {id} is not running (state: {state})")]
    NotRunning { id: HandleId, state: RunnerState },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
