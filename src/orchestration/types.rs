//! Type definitions for the orchestration subsystem.
//!
//! These types form the shared vocabulary between the [`super::manager::ReplicaManager`],
//! the tool dispatcher, the delegation tools, and the front end's status view.
//! Snapshot types derive [`serde::Serialize`] for JSON tool responses.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use crate::config::AgentConfig;

/// Unique identifier for a runner handle.
///
/// Wraps a UUID v4 string: collision-free, and readable in logs and tool output.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(String);

impl HandleId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a runner handle.
///
/// `Initializing -> Ready -> Running -> {Completed, Failed} -> Terminated`, with
/// `Terminating` entered only through an explicit terminate. A handle that fails
/// to start goes `Initializing -> Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Initializing,
    Ready,
    Running,
    Completed,
    Failed,
    Terminating,
    Terminated,
}

impl RunnerState {
    /// Completed, Failed, or Terminated. No transition leads back out of these
    /// except the move to Terminating/Terminated.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Failed | RunnerState::Terminated
        )
    }

    /// Whether `self -> next` is one of the listed lifecycle edges.
    pub fn can_transition_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Terminated)
                | (Failed, Terminated)
                | (Terminating, Terminated)
        ) || (next == Terminating && !matches!(self, Terminating | Terminated))
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Initializing => "initializing",
            RunnerState::Ready => "ready",
            RunnerState::Running => "running",
            RunnerState::Completed => "completed",
            RunnerState::Failed => "failed",
            RunnerState::Terminating => "terminating",
            RunnerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Read-only view of a runner handle, returned by snapshots and status queries.
///
/// This is a copy -- the registry entry may change after it is returned.
#[derive(Clone, Debug, Serialize)]
pub struct RunnerHandle {
    pub id: HandleId,
    #[serde(rename = "agent", serialize_with = "agent_name")]
    pub agent: Arc<AgentConfig>,
    /// Back-reference by id only; the parent owns the child's lifecycle.
    pub parent_id: Option<HandleId>,
    /// Distance from the root (root = 0).
    pub depth: usize,
    pub state: RunnerState,
    /// RFC 3339 timestamp of admission.
    pub created_at: String,
    /// RFC 3339 timestamp of the first terminal state.
    pub finished_at: Option<String>,
    /// Cause recorded by `mark_failed`.
    pub failure: Option<String>,
    /// Admission order, used to order snapshots.
    #[serde(skip)]
    pub seq: u64,
}

impl RunnerHandle {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

fn agent_name<S: Serializer>(agent: &Arc<AgentConfig>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&agent.name)
}

/// Result of a state transition call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The handle moved to the requested state.
    Applied,
    /// The handle was already in the requested state; nothing changed.
    Duplicate,
}

/// A request from a runner to invoke a named tool. Transient.
#[derive(Clone, Debug)]
pub struct ToolInvocationRequest {
    pub caller: HandleId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

impl ToolInvocationRequest {
    pub fn new(caller: HandleId, tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            caller,
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// How a child's task ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Result a child records when its task ends, readable by the parent until the
/// child is terminated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub agent_id: HandleId,
    pub status: OutcomeStatus,
    /// The child's final answer, or the failure cause.
    pub output: String,
    /// Wall-clock duration of the task in seconds.
    pub elapsed_secs: f64,
}
