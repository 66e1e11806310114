//! Toggler Test Utilities
//!
//! Shared test infrastructure for the Toggler workspace:
//! - A black-box contract suite every `Storage` implementation must pass
//! - A call-counting `Storage` wrapper for asserting cache effectiveness
//! - Entity fixtures for common scenarios

pub mod contract;
pub mod counting;
pub mod fixtures;

pub use contract::{eventually, run_all};
pub use counting::CountingStorage;

// Re-export core types for convenience
pub use toggler_core::{
    DeploymentEnvironment, EntityKind, Record, ReleaseFlag, ReleasePilot, ReleaseRollout,
    RolloutPlan, Token,
};
pub use toggler_storage::{Context, Storage, StorageError, StorageExt, StorageResult};
