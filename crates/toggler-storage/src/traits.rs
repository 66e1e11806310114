//! The domain storage contract.
//!
//! Every backend (the in-memory source, the cache manager, the pass-through
//! null cache) implements [`Storage`]. The trait is object safe: point CRUD
//! exchanges type-erased [`Record`]s, domain finders return concrete entities.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use toggler_core::{
    DeploymentEnvironment, Entity, EntityKind, Record, ReleaseFlag, ReleasePilot, ReleaseRollout,
    Token,
};

use crate::StorageResult;
use crate::context::Context;
use crate::events::{Mutation, Subscriber, Subscription};

/// A finite stream of records. Calling the producing method again re-reads.
pub type RecordStream = BoxStream<'static, StorageResult<Record>>;

/// A finite stream of typed entities.
pub type EntityStream<T> = BoxStream<'static, StorageResult<T>>;

/// The domain storage contract.
///
/// Lookups never treat absence as an error: `find_*` methods return `None`
/// or an empty stream. Point `update`/`delete_by_id` of a missing entity and
/// `create` of an existing id fail with `NotFound`/`AlreadyExists`.
///
/// # Example
///
/// ```ignore
/// use toggler_storage::{Context, Storage, StorageResult};
/// use toggler_core::ReleaseFlag;
///
/// async fn flag_exists(storage: &dyn Storage, name: &str) -> StorageResult<bool> {
///     let ctx = Context::background();
///     Ok(storage.find_release_flag_by_name(&ctx, name).await?.is_some())
/// }
/// ```
#[async_trait]
pub trait Storage: Send + Sync {
    // ==================== CRUD Operations ====================

    /// Stores a new entity. Assigns a fresh id when the record has none and
    /// writes it back into `record`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the id is already stored.
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()>;

    /// Looks up an entity by id.
    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>>;

    /// Streams every entity of a kind.
    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream>;

    /// Replaces an existing entity wholesale.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the entity does not exist.
    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()>;

    /// Deletes an entity by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the entity does not exist.
    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()>;

    /// Deletes every entity of a kind. Deleting from an empty kind succeeds.
    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()>;

    // ==================== Domain Finders ====================

    async fn find_release_flag_by_name(
        &self,
        ctx: &Context,
        name: &str,
    ) -> StorageResult<Option<ReleaseFlag>>;

    /// Flags whose name is in `names`. The order of `names` is irrelevant.
    async fn find_release_flags_by_names(
        &self,
        ctx: &Context,
        names: &[String],
    ) -> StorageResult<EntityStream<ReleaseFlag>>;

    async fn find_release_rollout_by_flag_and_environment(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
    ) -> StorageResult<Option<ReleaseRollout>>;

    /// The manual pilot entry for one external caller of a flag in an
    /// environment.
    async fn find_release_pilot_by_external_id(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> StorageResult<Option<ReleasePilot>>;

    async fn find_release_pilots_by_release_flag(
        &self,
        ctx: &Context,
        flag_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>>;

    async fn find_release_pilots_by_external_id(
        &self,
        ctx: &Context,
        external_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>>;

    async fn find_token_by_hash(&self, ctx: &Context, sha512: &str)
    -> StorageResult<Option<Token>>;

    /// An environment whose id or name equals `alias`.
    async fn find_deployment_environment_by_alias(
        &self,
        ctx: &Context,
        alias: &str,
    ) -> StorageResult<Option<DeploymentEnvironment>>;

    // ==================== Transactions ====================

    /// Opens a transaction and returns a context bound to it. Writes made
    /// through the returned context become visible to others, and publish
    /// their change events, on commit.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::TransactionError` if `ctx` already holds an
    /// open transaction.
    async fn begin_tx(&self, ctx: &Context) -> StorageResult<Context>;

    async fn commit_tx(&self, ctx: &Context) -> StorageResult<()>;

    async fn rollback_tx(&self, ctx: &Context) -> StorageResult<()>;

    // ==================== Subscriptions ====================

    /// Registers a subscriber for committed changes of one kind and mutation.
    async fn subscribe(
        &self,
        ctx: &Context,
        kind: EntityKind,
        mutation: Mutation,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription>;

    async fn subscribe_to_create(
        &self,
        ctx: &Context,
        kind: EntityKind,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        self.subscribe(ctx, kind, Mutation::Create, subscriber).await
    }

    async fn subscribe_to_update(
        &self,
        ctx: &Context,
        kind: EntityKind,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        self.subscribe(ctx, kind, Mutation::Update, subscriber).await
    }

    async fn subscribe_to_delete_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        self.subscribe(ctx, kind, Mutation::DeleteById, subscriber)
            .await
    }

    async fn subscribe_to_delete_all(
        &self,
        ctx: &Context,
        kind: EntityKind,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        self.subscribe(ctx, kind, Mutation::DeleteAll, subscriber)
            .await
    }

    // ==================== Lifecycle ====================

    /// Releases backend resources.
    async fn close(&self) -> StorageResult<()>;

    /// Returns the backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Builds a stream over already materialized items.
pub fn stream_of<T: Send + 'static>(items: Vec<T>) -> BoxStream<'static, StorageResult<T>> {
    stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Decodes a record stream into typed entities.
pub fn decode_stream<T: Entity>(records: RecordStream) -> EntityStream<T> {
    records
        .and_then(|record| async move { Ok(record.decode::<T>()?) })
        .boxed()
}

/// Drains a stream, failing on the first error.
pub async fn collect<T>(stream: BoxStream<'static, StorageResult<T>>) -> StorageResult<Vec<T>> {
    stream.try_collect().await
}
