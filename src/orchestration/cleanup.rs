//! Resource release for runner handles.
//!
//! Every handle admitted by the [`super::manager::ReplicaManager`] gets a
//! cleanup slot here. Resources acquired on the handle's behalf (provider
//! sessions, the child's task) are attached to the slot and released in
//! reverse order of attachment, exactly once, when the handle is terminated.
//!
//! Concurrent `release` calls for the same handle all wait for the single
//! in-flight release to finish, so a cascade never finalizes a parent while a
//! child's cleanup is still running elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use super::types::HandleId;

/// How long to wait for a runner task to observe cancellation before aborting it.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that must be given back when a runner goes away.
#[async_trait]
pub trait Releasable: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String;

    /// Release the resource. Must not fail; problems are logged by the implementor.
    async fn release(&self);
}

struct CleanupSlot {
    resources: Mutex<Vec<Box<dyn Releasable>>>,
    done: OnceCell<()>,
}

impl CleanupSlot {
    fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            done: OnceCell::new(),
        }
    }
}

/// Tracks per-handle resources and guarantees one release per handle.
#[derive(Clone, Default)]
pub struct CleanupCoordinator {
    slots: Arc<Mutex<HashMap<HandleId, Arc<CleanupSlot>>>>,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for a newly admitted handle. Called by the manager under its
    /// admission lock, so every `Initializing` handle has a slot.
    pub(crate) fn open(&self, id: &HandleId) {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(CleanupSlot::new()));
    }

    /// Attach a resource to a handle's slot.
    ///
    /// If the handle was already released (or never admitted), the resource is
    /// released immediately instead of being leaked.
    pub async fn attach(&self, id: &HandleId, resource: Box<dyn Releasable>) {
        let slot = self.slots.lock().unwrap().get(id).cloned();
        let rejected = match slot {
            Some(slot) if !slot.done.initialized() => {
                let mut resources = slot.resources.lock().unwrap();
                resources.push(resource);
                None
            }
            _ => Some(resource),
        };

        if let Some(resource) = rejected {
            tracing::debug!(
                handle_id = %id,
                resource = %resource.describe(),
                "Handle already released; releasing late resource immediately"
            );
            resource.release().await;
        }
    }

    /// Release everything attached to `id`, newest first.
    ///
    /// Idempotent: only the first call does work, later and concurrent calls wait
    /// for it to finish. Returns `true` if this call performed the release.
    pub async fn release(&self, id: &HandleId) -> bool {
        let Some(slot) = self.slots.lock().unwrap().get(id).cloned() else {
            return false;
        };

        let mut performed = false;
        let performed_flag = &mut performed;
        let pending = &slot.resources;
        slot.done
            .get_or_init(|| async move {
                *performed_flag = true;
                let resources: Vec<Box<dyn Releasable>> =
                    std::mem::take(&mut *pending.lock().unwrap());
                for resource in resources.into_iter().rev() {
                    tracing::debug!(handle_id = %id, resource = %resource.describe(), "Releasing");
                    resource.release().await;
                }
            })
            .await;

        if performed {
            tracing::debug!(handle_id = %id, "Cleanup complete");
        }
        performed
    }

    /// Whether the handle's release has completed.
    pub fn is_released(&self, id: &HandleId) -> bool {
        self.slots
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|slot| slot.done.initialized())
    }

    /// Drop bookkeeping for a fully released handle.
    pub(crate) fn forget(&self, id: &HandleId) {
        let mut slots = self.slots.lock().unwrap();
        if slots.get(id).is_some_and(|slot| slot.done.initialized()) {
            slots.remove(id);
        }
    }
}

/// The tokio task running a child runner. Releasing waits briefly for the task
/// to wind down after cancellation, then aborts it.
pub struct TaskResource {
    label: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskResource {
    pub fn new(label: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            label: label.into(),
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl Releasable for TaskResource {
    fn describe(&self) -> String {
        format!("task:{}", self.label)
    }

    async fn release(&self) {
        let handle = self.handle.lock().unwrap().take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(task = %self.label, "Runner task ignored cancellation; aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records release order into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Releasable for Recorder {
        fn describe(&self) -> String {
            self.name.to_string()
        }

        async fn release(&self) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.log.lock().unwrap().push(self.name);
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Releasable for Counter {
        fn describe(&self) -> String {
            "counter".into()
        }

        async fn release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn releases_in_reverse_attach_order() {
        let cleanup = CleanupCoordinator::new();
        let id = HandleId::from("h");
        let log = Arc::new(Mutex::new(Vec::new()));
        cleanup.open(&id);
        for name in ["session", "task"] {
            cleanup
                .attach(&id, Box::new(Recorder { name, log: log.clone() }))
                .await;
        }

        assert!(cleanup.release(&id).await);
        assert_eq!(*log.lock().unwrap(), vec!["task", "session"]);
        assert!(cleanup.is_released(&id));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let cleanup = CleanupCoordinator::new();
        let id = HandleId::from("h");
        let count = Arc::new(AtomicUsize::new(0));
        cleanup.open(&id);
        cleanup.attach(&id, Box::new(Counter(count.clone()))).await;

        assert!(cleanup.release(&id).await);
        assert!(!cleanup.release(&id).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_release_runs_once_and_all_callers_wait() {
        let cleanup = CleanupCoordinator::new();
        let id = HandleId::from("h");
        let log = Arc::new(Mutex::new(Vec::new()));
        cleanup.open(&id);
        cleanup
            .attach(&id, Box::new(Recorder { name: "slow", log: log.clone() }))
            .await;

        let (a, b) = tokio::join!(cleanup.release(&id), cleanup.release(&id));
        assert!(a ^ b, "exactly one caller performs the release");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_attach_is_released_immediately() {
        let cleanup = CleanupCoordinator::new();
        let id = HandleId::from("h");
        let count = Arc::new(AtomicUsize::new(0));
        cleanup.open(&id);
        cleanup.release(&id).await;

        cleanup.attach(&id, Box::new(Counter(count.clone()))).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_handle_release_is_noop() {
        let cleanup = CleanupCoordinator::new();
        assert!(!cleanup.release(&HandleId::from("ghost")).await);
    }

    #[tokio::test]
    async fn task_resource_waits_for_task() {
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(1, Ordering::SeqCst);
        });

        TaskResource::new("t", handle).release().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
