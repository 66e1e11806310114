//! In-memory source storage backend for Toggler.
//!
//! This crate provides an in-memory implementation of the `Storage` trait
//! from `toggler-storage`, using a papaya lock-free HashMap for concurrent
//! access. It supports one-phase transactions and publishes change events
//! for every committed write.
//!
//! # Example
//!
//! ```ignore
//! use toggler_db_memory::InMemoryStorage;
//! use toggler_storage::{Context, StorageExt};
//! use toggler_core::ReleaseFlag;
//!
//! let storage = InMemoryStorage::new();
//! let mut flag = ReleaseFlag::new("checkout-v2");
//! storage.create_entity(&Context::background(), &mut flag).await?;
//! ```

pub mod storage;
mod transaction;

pub use storage::{InMemoryStorage, StorageKey};

use toggler_storage::DeliveryMode;

/// Type alias for a shareable in-memory storage instance.
pub type DynInMemoryStorage = std::sync::Arc<InMemoryStorage>;

/// Creates a new in-memory storage with synchronous event delivery.
pub fn create_storage() -> DynInMemoryStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}

/// Creates a new in-memory storage with the given event delivery mode.
pub fn create_storage_with_delivery(mode: DeliveryMode) -> DynInMemoryStorage {
    std::sync::Arc::new(InMemoryStorage::with_delivery(mode))
}
