//! Central registry for runner handles.
//!
//! [`ReplicaManager`] is the single source of truth for the parent/child
//! hierarchy and for the global limits. Handles live in an arena keyed by
//! [`HandleId`]; parent links are ids, never owning pointers. All writes go
//! through the manager's methods, each of which takes the registry lock once,
//! so admission under concurrent spawn requests cannot overbook a limit.
//!
//! **Concurrency model:** `Arc<Mutex<Registry>>` with a std mutex that is never
//! held across an `.await`. Cleanup (which is async) runs outside the lock.
//!
//! **Cancellation model:** each handle holds a [`CancellationToken`] created as
//! a child of its parent's token (or the root token for the root runner).
//! Terminating a subtree cancels every token in it before any cleanup runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::cleanup::CleanupCoordinator;
use super::types::{HandleId, RunnerHandle, RunnerState, TransitionOutcome};
use crate::config::{AgentConfig, RuntimeLimits};
use crate::error::OrchestratorError;

/// Emitted on every state change, in the order the changes were applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    StateChanged {
        id: HandleId,
        from: Option<RunnerState>,
        to: RunnerState,
    },
}

/// Internal entry stored in the arena. Callers only ever see
/// [`RunnerHandle`] copies.
struct Entry {
    handle: RunnerHandle,
    cancel_token: CancellationToken,
    /// Live children in admission order.
    children: Vec<HandleId>,
}

#[derive(Default)]
struct Registry {
    live: HashMap<HandleId, Entry>,
    /// Terminated handles, kept so late transitions report `InvalidTransition`
    /// instead of an unknown id. Ids are never reused.
    retired: HashMap<HandleId, RunnerHandle>,
    root: Option<HandleId>,
    /// Live non-root handles; bounded by `max_global_children`.
    live_children: usize,
    next_seq: u64,
}

/// Owner of the runner arena and enforcer of the runtime limits.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct ReplicaManager {
    registry: Arc<Mutex<Registry>>,
    root_cancel_token: CancellationToken,
    limits: RuntimeLimits,
    cleanup: CleanupCoordinator,
    event_tx: Option<UnboundedSender<RegistryEvent>>,
}

impl ReplicaManager {
    pub fn new(limits: RuntimeLimits, cleanup: CleanupCoordinator) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            root_cancel_token: CancellationToken::new(),
            limits,
            cleanup,
            event_tx: None,
        }
    }

    /// Stream state changes to `tx` (used by the front end and by tests).
    pub fn with_events(mut self, tx: UnboundedSender<RegistryEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn limits(&self) -> RuntimeLimits {
        self.limits
    }

    pub fn cleanup(&self) -> &CleanupCoordinator {
        &self.cleanup
    }

    /// Admit the root runner (depth 0). Only one root may be live at a time,
    /// and none after [`ReplicaManager::shutdown_all`].
    pub fn register_root(&self, agent: Arc<AgentConfig>) -> Result<RunnerHandle, OrchestratorError> {
        if self.root_cancel_token.is_cancelled() {
            return Err(OrchestratorError::ShutDown);
        }
        let mut reg = self.registry.lock().unwrap();
        if let Some(root) = &reg.root {
            return Err(OrchestratorError::RootAlreadyExists(root.clone()));
        }

        let token = self.root_cancel_token.child_token();
        let handle = self.admit(&mut reg, agent, None, 0, token);
        reg.root = Some(handle.id.clone());

        tracing::info!(handle_id = %handle.id, agent = %handle.agent.name, "Root runner admitted");
        Ok(handle)
    }

    /// Validate and admit a child of `parent_id`.
    ///
    /// On success the slot is reserved and the handle is `Initializing`. On
    /// failure nothing is reserved.
    pub fn request_spawn(
        &self,
        parent_id: &HandleId,
        agent: Arc<AgentConfig>,
    ) -> Result<RunnerHandle, OrchestratorError> {
        let mut reg = self.registry.lock().unwrap();

        let parent = match reg.live.get(parent_id) {
            Some(p) if accepts_children(p.handle.state) => p,
            _ => {
                tracing::warn!(parent_id = %parent_id, "Spawn rejected: parent not live");
                return Err(OrchestratorError::UnknownParent(parent_id.clone()));
            }
        };

        let depth = parent.handle.depth + 1;
        if depth > self.limits.max_recursion_depth {
            tracing::warn!(parent_id = %parent_id, depth, "Spawn rejected: depth exceeded");
            return Err(OrchestratorError::DepthExceeded {
                depth,
                max: self.limits.max_recursion_depth,
            });
        }

        let existing = parent.children.len();
        if existing >= 1 && !parent.handle.is_root() && !parent.handle.agent.is_recursible {
            tracing::warn!(parent_id = %parent_id, "Spawn rejected: parent not recursible");
            return Err(OrchestratorError::NotRecursible(parent_id.clone()));
        }

        if let Some(max) = parent.handle.agent.max_children {
            if existing >= max {
                tracing::warn!(parent_id = %parent_id, max, "Spawn rejected: per-agent child limit");
                return Err(OrchestratorError::ChildLimitExceeded {
                    parent: parent_id.clone(),
                    max,
                });
            }
        }

        if reg.live_children >= self.limits.max_global_children {
            tracing::warn!(
                parent_id = %parent_id,
                live = reg.live_children,
                "Spawn rejected: global child limit"
            );
            return Err(OrchestratorError::GlobalLimitExceeded {
                max: self.limits.max_global_children,
            });
        }

        let token = parent.cancel_token.child_token();
        let handle = self.admit(&mut reg, agent, Some(parent_id.clone()), depth, token);
        reg.live_children += 1;
        if let Some(parent) = reg.live.get_mut(parent_id) {
            parent.children.push(handle.id.clone());
        }
        self.check_invariants(&reg);

        tracing::info!(
            handle_id = %handle.id,
            parent_id = %parent_id,
            agent = %handle.agent.name,
            depth,
            live_children = reg.live_children,
            "Child runner admitted"
        );
        Ok(handle)
    }

    fn admit(
        &self,
        reg: &mut Registry,
        agent: Arc<AgentConfig>,
        parent_id: Option<HandleId>,
        depth: usize,
        cancel_token: CancellationToken,
    ) -> RunnerHandle {
        let seq = reg.next_seq;
        reg.next_seq += 1;

        let handle = RunnerHandle {
            id: HandleId::generate(),
            agent,
            parent_id,
            depth,
            state: RunnerState::Initializing,
            created_at: Utc::now().to_rfc3339(),
            finished_at: None,
            failure: None,
            seq,
        };

        self.cleanup.open(&handle.id);
        reg.live.insert(
            handle.id.clone(),
            Entry {
                handle: handle.clone(),
                cancel_token,
                children: Vec::new(),
            },
        );
        self.emit(&handle.id, None, RunnerState::Initializing);
        handle
    }

    pub fn mark_ready(&self, id: &HandleId) -> Result<TransitionOutcome, OrchestratorError> {
        self.transition(id, RunnerState::Ready, None)
    }

    pub fn mark_running(&self, id: &HandleId) -> Result<TransitionOutcome, OrchestratorError> {
        self.transition(id, RunnerState::Running, None)
    }

    pub fn mark_completed(&self, id: &HandleId) -> Result<TransitionOutcome, OrchestratorError> {
        self.transition(id, RunnerState::Completed, None)
    }

    pub fn mark_failed(
        &self,
        id: &HandleId,
        cause: impl Into<String>,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        self.transition(id, RunnerState::Failed, Some(cause.into()))
    }

    /// Apply a lifecycle transition.
    ///
    /// Re-entering the current state is a benign duplicate. Any edge not in the
    /// lifecycle, including anything after `Terminated`, is `InvalidTransition`.
    fn transition(
        &self,
        id: &HandleId,
        next: RunnerState,
        failure: Option<String>,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        let mut reg = self.registry.lock().unwrap();

        let Some(entry) = reg.live.get_mut(id) else {
            return match reg.retired.get(id) {
                Some(_) => Err(OrchestratorError::InvalidTransition {
                    id: id.clone(),
                    from: RunnerState::Terminated,
                    to: next,
                }),
                None => Err(OrchestratorError::UnknownHandle(id.clone())),
            };
        };

        let current = entry.handle.state;
        if current == next {
            tracing::debug!(handle_id = %id, state = %next, "Duplicate transition ignored");
            return Ok(TransitionOutcome::Duplicate);
        }
        if !current.can_transition_to(next) {
            tracing::warn!(handle_id = %id, from = %current, to = %next, "Invalid transition");
            return Err(OrchestratorError::InvalidTransition {
                id: id.clone(),
                from: current,
                to: next,
            });
        }

        entry.handle.state = next;
        if next.is_terminal() && entry.handle.finished_at.is_none() {
            entry.handle.finished_at = Some(Utc::now().to_rfc3339());
        }
        if let Some(cause) = failure {
            entry.handle.failure = Some(cause);
        }

        tracing::debug!(handle_id = %id, from = %current, to = %next, "Transition applied");
        self.emit(id, Some(current), next);
        Ok(TransitionOutcome::Applied)
    }

    /// Terminate a handle, releasing its resources and its registry slot.
    ///
    /// With `cascade`, every live descendant is cancelled first and then
    /// terminated bottom-up (youngest sibling first), so each child reaches
    /// `Terminated` before its parent does. Without `cascade`, a handle that
    /// still has live children is refused rather than orphaning them.
    ///
    /// Terminating a handle that is already terminated, or already being
    /// terminated, is a benign duplicate. The latter still waits for the
    /// subtree to finish.
    pub async fn terminate(
        &self,
        id: &HandleId,
        cascade: bool,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        let (order, already_terminating) = {
            let mut reg = self.registry.lock().unwrap();

            let Some(entry) = reg.live.get(id) else {
                return if reg.retired.contains_key(id) {
                    Ok(TransitionOutcome::Duplicate)
                } else {
                    Err(OrchestratorError::UnknownHandle(id.clone()))
                };
            };

            if !cascade && !entry.children.is_empty() {
                return Err(OrchestratorError::HasLiveChildren(id.clone()));
            }

            let already_terminating = entry.handle.state == RunnerState::Terminating;
            let order = post_order(&reg, id);
            for node in &order {
                if let Some(entry) = reg.live.get_mut(node) {
                    entry.cancel_token.cancel();
                    let from = entry.handle.state;
                    if from != RunnerState::Terminating {
                        entry.handle.state = RunnerState::Terminating;
                        self.emit(node, Some(from), RunnerState::Terminating);
                    }
                }
            }
            (order, already_terminating)
        };

        tracing::info!(handle_id = %id, subtree = order.len(), "Terminating runner");

        for node in &order {
            self.cleanup.release(node).await;
            self.finalize(node);
        }

        if already_terminating {
            Ok(TransitionOutcome::Duplicate)
        } else {
            Ok(TransitionOutcome::Applied)
        }
    }

    /// Move a released handle out of the live arena.
    fn finalize(&self, id: &HandleId) {
        let mut reg = self.registry.lock().unwrap();
        let Some(mut entry) = reg.live.remove(id) else {
            // A concurrent terminate got here first.
            return;
        };

        if !entry.children.is_empty() {
            registry_corrupted(&format!(
                "runner {id} finalized while children {:?} are live",
                entry.children
            ));
        }

        let from = entry.handle.state;
        entry.handle.state = RunnerState::Terminated;
        if entry.handle.finished_at.is_none() {
            entry.handle.finished_at = Some(Utc::now().to_rfc3339());
        }

        match &entry.handle.parent_id {
            Some(parent_id) => {
                reg.live_children = reg.live_children.checked_sub(1).unwrap_or_else(|| {
                    registry_corrupted("live child count would go negative");
                });
                if let Some(parent) = reg.live.get_mut(parent_id) {
                    parent.children.retain(|c| c != id);
                }
            }
            None => {
                if reg.root.as_ref() == Some(id) {
                    reg.root = None;
                }
            }
        }

        self.cleanup.forget(id);
        self.emit(id, Some(from), RunnerState::Terminated);
        tracing::debug!(handle_id = %id, "Runner terminated");
        reg.retired.insert(id.clone(), entry.handle);
        self.check_invariants(&reg);
    }

    /// Point-in-time copy of every live handle, in admission order.
    pub fn snapshot(&self) -> Vec<RunnerHandle> {
        let reg = self.registry.lock().unwrap();
        let mut handles: Vec<RunnerHandle> = reg.live.values().map(|e| e.handle.clone()).collect();
        handles.sort_by_key(|h| h.seq);
        handles
    }

    /// Look up a handle, live or terminated.
    pub fn get(&self, id: &HandleId) -> Option<RunnerHandle> {
        let reg = self.registry.lock().unwrap();
        reg.live
            .get(id)
            .map(|e| e.handle.clone())
            .or_else(|| reg.retired.get(id).cloned())
    }

    /// Live handles whose parent is `parent_id`, in admission order.
    pub fn children_of(&self, parent_id: &HandleId) -> Vec<RunnerHandle> {
        let reg = self.registry.lock().unwrap();
        reg.live
            .get(parent_id)
            .map(|p| {
                p.children
                    .iter()
                    .filter_map(|c| reg.live.get(c).map(|e| e.handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `ancestor` is a strict ancestor of `id` in the live tree.
    pub fn is_ancestor(&self, ancestor: &HandleId, id: &HandleId) -> bool {
        let reg = self.registry.lock().unwrap();
        let mut cursor = reg.live.get(id).and_then(|e| e.handle.parent_id.clone());
        while let Some(current) = cursor {
            if &current == ancestor {
                return true;
            }
            cursor = reg.live.get(&current).and_then(|e| e.handle.parent_id.clone());
        }
        false
    }

    pub fn root(&self) -> Option<HandleId> {
        self.registry.lock().unwrap().root.clone()
    }

    /// The handle's cancellation token, if it is live.
    pub fn cancel_token(&self, id: &HandleId) -> Option<CancellationToken> {
        let reg = self.registry.lock().unwrap();
        reg.live.get(id).map(|e| e.cancel_token.clone())
    }

    /// Number of live non-root handles.
    pub fn live_children(&self) -> usize {
        self.registry.lock().unwrap().live_children
    }

    /// Cancel the whole tree and terminate the root, if any.
    ///
    /// Shutdown is final: afterwards `register_root` fails with `ShutDown`.
    pub async fn shutdown_all(&self) {
        self.root_cancel_token.cancel();
        if let Some(root) = self.root() {
            if let Err(e) = self.terminate(&root, true).await {
                tracing::warn!("Shutdown could not terminate root: {}", e);
            }
        }
    }

    fn emit(&self, id: &HandleId, from: Option<RunnerState>, to: RunnerState) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(RegistryEvent::StateChanged {
                id: id.clone(),
                from,
                to,
            });
        }
    }

    fn check_invariants(&self, reg: &Registry) {
        if reg.live_children > self.limits.max_global_children {
            registry_corrupted(&format!(
                "{} live children exceed the limit of {}",
                reg.live_children, self.limits.max_global_children
            ));
        }
        for entry in reg.live.values() {
            if let Some(parent) = &entry.handle.parent_id {
                if !reg.live.contains_key(parent) {
                    registry_corrupted(&format!(
                        "runner {} outlived its parent {parent}",
                        entry.handle.id
                    ));
                }
            }
            if entry.handle.depth > self.limits.max_recursion_depth {
                registry_corrupted(&format!("runner {} exceeds max depth", entry.handle.id));
            }
        }
    }
}

/// Parents must be live and not yet finished or winding down.
fn accepts_children(state: RunnerState) -> bool {
    matches!(
        state,
        RunnerState::Initializing | RunnerState::Ready | RunnerState::Running
    )
}

/// Live subtree rooted at `id`, children before parents, younger siblings first.
fn post_order(reg: &Registry, id: &HandleId) -> Vec<HandleId> {
    fn visit(reg: &Registry, id: &HandleId, out: &mut Vec<HandleId>) {
        if let Some(entry) = reg.live.get(id) {
            for child in entry.children.iter().rev() {
                visit(reg, child, out);
            }
            out.push(id.clone());
        }
    }

    let mut out = Vec::new();
    visit(reg, id, &mut out);
    out
}

/// An invariant of the arena no longer holds: this is a bug in the core, not a
/// usage error, and continuing would hand out wrong answers.
fn registry_corrupted(detail: &str) -> ! {
    tracing::error!(detail, "Runner registry corrupted; aborting");
    eprintln!("replica: runner registry corrupted: {detail}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Helper to create a manager with the given limits.
    fn test_manager(max_children: usize, max_depth: usize) -> ReplicaManager {
        let limits = RuntimeLimits {
            max_global_children: max_children,
            default_timeout_seconds: 5,
            max_recursion_depth: max_depth,
        };
        ReplicaManager::new(limits, CleanupCoordinator::new())
    }

    fn agent(name: &str) -> Arc<AgentConfig> {
        Arc::new(AgentConfig::new(name, "echo"))
    }

    fn ready_root(mgr: &ReplicaManager) -> HandleId {
        let root = mgr.register_root(Arc::new(AgentConfig::new("main", "echo").main())).unwrap();
        mgr.mark_ready(&root.id).unwrap();
        root.id
    }

    #[test]
    fn root_is_depth_zero_and_unique() {
        let mgr = test_manager(3, 3);
        let root = ready_root(&mgr);
        assert_eq!(mgr.get(&root).unwrap().depth, 0);
        assert!(matches!(
            mgr.register_root(agent("other")),
            Err(OrchestratorError::RootAlreadyExists(_))
        ));
    }

    #[test]
    fn child_depth_is_parent_plus_one() {
        let mgr = test_manager(5, 3);
        let root = ready_root(&mgr);
        let a = mgr
            .request_spawn(&root, Arc::new(AgentConfig::new("a", "echo").recursible()))
            .unwrap();
        mgr.mark_ready(&a.id).unwrap();
        let b = mgr.request_spawn(&a.id, agent("b")).unwrap();

        assert_eq!(a.depth, 1);
        assert_eq!(b.depth, 2);
        assert_eq!(b.parent_id.as_ref(), Some(&a.id));
        assert_eq!(b.state, RunnerState::Initializing);
        assert!(mgr.is_ancestor(&root, &b.id));
        assert!(!mgr.is_ancestor(&b.id, &root));
    }

    #[test]
    fn limits_scenario() {
        // max 2 children, max depth 1
        let mgr = test_manager(2, 1);
        let root = ready_root(&mgr);

        let a = mgr.request_spawn(&root, agent("a")).unwrap();
        assert_eq!(a.depth, 1);
        mgr.mark_ready(&a.id).unwrap();

        let grandchild = mgr.request_spawn(&a.id, agent("b"));
        assert!(matches!(
            grandchild,
            Err(OrchestratorError::DepthExceeded { depth: 2, max: 1 })
        ));

        mgr.request_spawn(&root, agent("c")).unwrap();
        assert_eq!(mgr.live_children(), 2);

        let d = mgr.request_spawn(&root, agent("d"));
        assert!(matches!(d, Err(OrchestratorError::GlobalLimitExceeded { max: 2 })));
        assert_eq!(mgr.live_children(), 2);
    }

    #[test]
    fn non_recursible_parent_gets_exactly_one_child() {
        let mgr = test_manager(10, 5);
        let root = ready_root(&mgr);
        let parent = mgr.request_spawn(&root, agent("leafy")).unwrap();
        mgr.mark_ready(&parent.id).unwrap();

        mgr.request_spawn(&parent.id, agent("first")).unwrap();
        let second = mgr.request_spawn(&parent.id, agent("second"));
        assert!(matches!(second, Err(OrchestratorError::NotRecursible(_))));
    }

    #[test]
    fn root_is_implicitly_recursible() {
        let mgr = test_manager(10, 5);
        let root = mgr.register_root(agent("main")).unwrap();
        for _ in 0..3 {
            mgr.request_spawn(&root.id, agent("w")).unwrap();
        }
        assert_eq!(mgr.children_of(&root.id).len(), 3);
    }

    #[test]
    fn per_agent_child_limit() {
        let mgr = test_manager(10, 5);
        let root = mgr
            .register_root(Arc::new(AgentConfig::new("main", "echo").with_max_children(1)))
            .unwrap();
        mgr.request_spawn(&root.id, agent("w")).unwrap();
        assert!(matches!(
            mgr.request_spawn(&root.id, agent("w")),
            Err(OrchestratorError::ChildLimitExceeded { max: 1, .. })
        ));
    }

    #[test]
    fn unknown_parent_reserves_nothing() {
        let mgr = test_manager(2, 2);
        ready_root(&mgr);
        let result = mgr.request_spawn(&HandleId::from("ghost"), agent("x"));
        assert!(matches!(result, Err(OrchestratorError::UnknownParent(_))));
        assert_eq!(mgr.live_children(), 0);
        assert_eq!(mgr.snapshot().len(), 1);
    }

    #[test]
    fn finished_parent_cannot_spawn() {
        let mgr = test_manager(5, 5);
        let root = ready_root(&mgr);
        let child = mgr.request_spawn(&root, agent("c")).unwrap();
        mgr.mark_ready(&child.id).unwrap();
        mgr.mark_running(&child.id).unwrap();
        mgr.mark_completed(&child.id).unwrap();

        assert!(matches!(
            mgr.request_spawn(&child.id, agent("late")),
            Err(OrchestratorError::UnknownParent(_))
        ));
    }

    #[test]
    fn duplicate_and_invalid_transitions() {
        let mgr = test_manager(5, 5);
        let root = ready_root(&mgr);
        let c = mgr.request_spawn(&root, agent("c")).unwrap();

        assert!(matches!(
            mgr.mark_running(&c.id),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
        assert_eq!(mgr.mark_ready(&c.id).unwrap(), TransitionOutcome::Applied);
        assert_eq!(mgr.mark_ready(&c.id).unwrap(), TransitionOutcome::Duplicate);
        mgr.mark_running(&c.id).unwrap();
        assert_eq!(mgr.mark_completed(&c.id).unwrap(), TransitionOutcome::Applied);
        assert_eq!(mgr.mark_completed(&c.id).unwrap(), TransitionOutcome::Duplicate);
        assert!(matches!(
            mgr.mark_failed(&c.id, "late"),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
        assert!(mgr.get(&c.id).unwrap().finished_at.is_some());
    }

    #[test]
    fn mark_failed_records_cause() {
        let mgr = test_manager(5, 5);
        let root = ready_root(&mgr);
        let c = mgr.request_spawn(&root, agent("c")).unwrap();
        mgr.mark_failed(&c.id, "provider unreachable").unwrap();

        let info = mgr.get(&c.id).unwrap();
        assert_eq!(info.state, RunnerState::Failed);
        assert_eq!(info.failure.as_deref(), Some("provider unreachable"));
    }

    #[tokio::test]
    async fn completed_after_terminated_is_invalid() {
        let mgr = test_manager(5, 5);
        let root = ready_root(&mgr);
        let c = mgr.request_spawn(&root, agent("c")).unwrap();
        mgr.mark_ready(&c.id).unwrap();
        mgr.mark_running(&c.id).unwrap();
        mgr.mark_completed(&c.id).unwrap();
        mgr.terminate(&c.id, false).await.unwrap();

        assert!(matches!(
            mgr.mark_completed(&c.id),
            Err(OrchestratorError::InvalidTransition {
                from: RunnerState::Terminated,
                ..
            })
        ));
        assert_eq!(
            mgr.terminate(&c.id, true).await.unwrap(),
            TransitionOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn terminate_frees_slot() {
        let mgr = test_manager(1, 2);
        let root = ready_root(&mgr);
        let c = mgr.request_spawn(&root, agent("c")).unwrap();
        assert!(mgr.request_spawn(&root, agent("d")).is_err());

        mgr.terminate(&c.id, true).await.unwrap();
        assert_eq!(mgr.live_children(), 0);
        mgr.request_spawn(&root, agent("d")).unwrap();
    }

    #[tokio::test]
    async fn non_cascade_terminate_refuses_live_children() {
        let mgr = test_manager(5, 5);
        let root = ready_root(&mgr);
        mgr.request_spawn(&root, agent("c")).unwrap();

        assert!(matches!(
            mgr.terminate(&root, false).await,
            Err(OrchestratorError::HasLiveChildren(_))
        ));
        assert_eq!(mgr.get(&root).unwrap().state, RunnerState::Ready);
    }

    #[tokio::test]
    async fn cascade_terminates_descendants_before_parent() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mgr = test_manager(10, 5).with_events(tx);
        let root = ready_root(&mgr);

        let a = mgr
            .request_spawn(&root, Arc::new(AgentConfig::new("a", "echo").recursible()))
            .unwrap();
        mgr.mark_ready(&a.id).unwrap();
        let a1 = mgr.request_spawn(&a.id, agent("a1")).unwrap();
        let a2 = mgr.request_spawn(&a.id, agent("a2")).unwrap();
        let b = mgr.request_spawn(&root, agent("b")).unwrap();
        let tokens: Vec<_> = [&a.id, &a1.id, &a2.id, &b.id]
            .iter()
            .map(|id| mgr.cancel_token(id).unwrap())
            .collect();

        mgr.terminate(&root, true).await.unwrap();

        assert!(tokens.iter().all(|t| t.is_cancelled()));
        assert!(mgr.snapshot().is_empty());
        assert!(mgr.root().is_none());

        let mut terminated = Vec::new();
        while let Ok(RegistryEvent::StateChanged { id, to, .. }) = rx.try_recv() {
            if to == RunnerState::Terminated {
                terminated.push(id);
            }
        }
        let pos = |id: &HandleId| terminated.iter().position(|t| t == id).unwrap();
        assert!(pos(&a1.id) < pos(&a.id));
        assert!(pos(&a2.id) < pos(&a.id));
        assert!(pos(&a.id) < pos(&root));
        assert!(pos(&b.id) < pos(&root));
        // Younger siblings go first.
        assert!(pos(&a2.id) < pos(&a1.id));
        assert!(pos(&b.id) < pos(&a.id));
    }

    struct SlowRelease;

    #[async_trait::async_trait]
    impl crate::orchestration::cleanup::Releasable for SlowRelease {
        fn describe(&self) -> String {
            "slow".into()
        }

        async fn release(&self) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    #[tokio::test]
    async fn second_terminate_while_terminating_is_duplicate() {
        let mgr = test_manager(5, 5);
        let root = ready_root(&mgr);
        let c = mgr.request_spawn(&root, agent("c")).unwrap();
        mgr.cleanup().attach(&c.id, Box::new(SlowRelease)).await;

        let first = tokio::spawn({
            let mgr = mgr.clone();
            let id = c.id.clone();
            async move { mgr.terminate(&id, true).await }
        });
        while mgr.get(&c.id).unwrap().state != RunnerState::Terminating {
            tokio::task::yield_now().await;
        }

        let second = mgr.terminate(&c.id, true).await.unwrap();
        assert_eq!(second, TransitionOutcome::Duplicate);
        // The duplicate call only returns once the release has finished.
        assert_eq!(mgr.get(&c.id).unwrap().state, RunnerState::Terminated);
        assert_eq!(first.await.unwrap().unwrap(), TransitionOutcome::Applied);
    }

    #[tokio::test]
    async fn shutdown_is_final() {
        let mgr = test_manager(5, 5);
        ready_root(&mgr);
        mgr.shutdown_all().await;

        assert!(mgr.root().is_none());
        assert!(matches!(
            mgr.register_root(Arc::new(AgentConfig::new("main", "echo").main())),
            Err(OrchestratorError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn cascade_blocks_new_spawns_in_subtree() {
        let mgr = test_manager(10, 5);
        let root = ready_root(&mgr);
        let a = mgr.request_spawn(&root, agent("a")).unwrap();
        mgr.mark_ready(&a.id).unwrap();

        mgr.terminate(&a.id, true).await.unwrap();
        assert!(matches!(
            mgr.request_spawn(&a.id, agent("x")),
            Err(OrchestratorError::UnknownParent(_))
        ));
    }

    #[test]
    fn snapshot_is_in_admission_order_with_unique_ids() {
        let mgr = test_manager(10, 5);
        let root = ready_root(&mgr);
        for _ in 0..5 {
            mgr.request_spawn(&root, agent("w")).unwrap();
        }
        let snap = mgr.snapshot();
        assert_eq!(snap.len(), 6);
        assert!(snap.windows(2).all(|w| w[0].seq < w[1].seq));
        let ids: HashSet<_> = snap.iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids.len(), 6);
        assert!(snap[0].is_root());
    }

    #[tokio::test]
    async fn concurrent_spawns_never_overbook() {
        let mgr = test_manager(3, 2);
        let root = ready_root(&mgr);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            let root = root.clone();
            tasks.push(tokio::spawn(async move {
                mgr.request_spawn(&root, Arc::new(AgentConfig::new("w", "echo"))).is_ok()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(mgr.live_children(), 3);
    }

    #[tokio::test]
    async fn unknown_handle_operations() {
        let mgr = test_manager(1, 1);
        let ghost = HandleId::from("ghost");
        assert!(matches!(
            mgr.mark_ready(&ghost),
            Err(OrchestratorError::UnknownHandle(_))
        ));
        assert!(matches!(
            mgr.terminate(&ghost, true).await,
            Err(OrchestratorError::UnknownHandle(_))
        ));
    }
}
