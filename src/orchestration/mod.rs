//! Runner supervision.
//!
//! [`manager::ReplicaManager`] owns the runner tree and its limits,
//! [`cleanup::CleanupCoordinator`] releases what each runner acquired, and
//! [`supervisor::Orchestrator`] drives runners through their lifecycle on top
//! of both. Shared types live in [`types`].

pub mod bounded;
pub mod cleanup;
pub mod manager;
pub mod supervisor;
pub mod types;

pub use manager::{RegistryEvent, ReplicaManager};
pub use supervisor::{Orchestrator, OrchestratorBuilder};
