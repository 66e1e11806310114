//! The cache storage contract.
//!
//! A [`CacheStorage`] holds entity copies and [`CachedQuery`] rows. It knows
//! nothing about what is being cached or when it goes stale; the
//! [`CacheManager`](crate::CacheManager) decides that.

use async_trait::async_trait;
use toggler_core::{EntityKind, Record};
use toggler_storage::{Context, RecordStream, StorageResult, collect, decode_stream};

use crate::query::CachedQuery;

/// Persistence contract for cache backends.
///
/// Values cross this boundary by copy. A backend never hands out a reference
/// into its internal state.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Inserts a new value, assigning an id when it has none.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the id is already stored.
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()>;

    /// Looks up a value. A miss is `Ok(None)`, never an error.
    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>>;

    /// Streams every stored value of a kind.
    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream>;

    /// Replaces a stored value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the id is not stored.
    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the id is not stored.
    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()>;

    /// Drops every value of a kind. An empty kind is not an error.
    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()>;

    /// Creates or replaces every record, keyed by its own id. Records without
    /// an id get a fresh one written back.
    async fn upsert_many(&self, ctx: &Context, records: &mut [Record]) -> StorageResult<()>;

    /// Resolves ids to values in the given order.
    ///
    /// The stream yields `StorageError::NotFound` for the first id that no
    /// longer resolves. Callers treat that as a stale query result.
    async fn find_by_ids(
        &self,
        ctx: &Context,
        kind: EntityKind,
        ids: &[String],
    ) -> StorageResult<RecordStream>;

    /// Releases sockets and background workers.
    async fn close(&self) -> StorageResult<()>;

    /// Returns the backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Helpers for [`CachedQuery`] rows on every [`CacheStorage`].
#[async_trait]
pub trait CacheStorageExt: CacheStorage {
    async fn find_cached_query(&self, ctx: &Context, id: &str) -> StorageResult<Option<CachedQuery>> {
        match self.find_by_id(ctx, EntityKind::CachedQuery, id).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    async fn store_cached_query(&self, ctx: &Context, query: &CachedQuery) -> StorageResult<()> {
        let mut records = [Record::from_entity(query)?];
        self.upsert_many(ctx, &mut records).await
    }

    /// Every cached query row for an entity tag.
    async fn cached_queries_for(
        &self,
        ctx: &Context,
        entity_type: &str,
    ) -> StorageResult<Vec<CachedQuery>> {
        let rows = self.find_all(ctx, EntityKind::CachedQuery).await?;
        let rows: Vec<CachedQuery> = collect(decode_stream(rows)).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.entity_type == entity_type)
            .collect())
    }

    /// Drops every cached query row for an entity tag, returning how many
    /// were dropped. Rows deleted concurrently are skipped.
    async fn delete_cached_queries_for(
        &self,
        ctx: &Context,
        entity_type: &str,
    ) -> StorageResult<usize> {
        let mut dropped = 0;
        for row in self.cached_queries_for(ctx, entity_type).await? {
            match self
                .delete_by_id(ctx, EntityKind::CachedQuery, &row.id)
                .await
            {
                Ok(()) => dropped += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(dropped)
    }
}

impl<C: CacheStorage + ?Sized> CacheStorageExt for C {}
