//! # toggler-storage
//!
//! Storage contract for the Toggler release-management backend.
//!
//! This crate defines the traits and types shared by every storage backend.
//! It does not contain any implementations; the in-memory source lives in
//! `toggler-db-memory` and the caching layer in `toggler-cache`.
//!
//! ## Overview
//!
//! - [`Storage`]: point CRUD, domain finders, one-phase transactions and
//!   change-event subscriptions.
//! - [`Context`]: request-scoped cancellation, deadline and transaction state.
//! - [`EventBus`]: routes [`ChangeEvent`]s to [`Subscriber`]s, synchronously
//!   or from background tasks.
//! - [`StorageExt`]: typed CRUD helpers over any `Storage`.
//!
//! ## Example
//!
//! ```ignore
//! use toggler_core::ReleaseFlag;
//! use toggler_storage::prelude::*;
//!
//! async fn rename(storage: &dyn Storage, id: &str, name: &str) -> StorageResult<()> {
//!     let ctx = Context::background();
//!     let mut flag: ReleaseFlag = storage
//!         .find_entity(&ctx, id)
//!         .await?
//!         .ok_or_else(|| StorageError::not_found(EntityKind::ReleaseFlag, id))?;
//!     flag.name = name.to_string();
//!     storage.update_entity(&ctx, &flag).await
//! }
//! ```

pub mod context;
mod error;
pub mod events;
mod ext;
mod traits;

pub use context::{Context, TransactionHandle};
pub use error::{ErrorCategory, StorageError};
pub use events::{ChangeEvent, DeliveryMode, EventBus, Mutation, Subscriber, Subscription};
pub use ext::StorageExt;
pub use traits::{EntityStream, RecordStream, Storage, collect, decode_stream, stream_of};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared storage trait object.
pub type DynStorage = std::sync::Arc<dyn Storage>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use toggler_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::events::{ChangeEvent, Mutation, Subscriber, Subscription};
    pub use crate::ext::StorageExt;
    pub use crate::traits::{EntityStream, RecordStream, Storage};
    pub use crate::{DynStorage, StorageResult};
    pub use toggler_core::{EntityKind, Record};
}
