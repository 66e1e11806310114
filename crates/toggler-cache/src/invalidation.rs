//! Subscription-driven cache invalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use toggler_core::{EntityKind, EntityRegistry};
use toggler_storage::{ChangeEvent, Context, Mutation, StorageError, StorageResult, Subscriber};
use tracing::{debug, error};

use crate::storage::{CacheStorage, CacheStorageExt};

/// Per-kind invalidation counters.
///
/// Every invalidation bumps the counter of its kind before touching the
/// cache. A reader that saw a different value before fetching from the
/// source knows an invalidation raced with it and must not keep what it
/// stored.
#[derive(Debug)]
pub(crate) struct Generations {
    counters: HashMap<EntityKind, AtomicU64>,
}

impl Generations {
    pub(crate) fn new() -> Self {
        Self {
            counters: EntityKind::ALL
                .iter()
                .map(|kind| (*kind, AtomicU64::new(0)))
                .collect(),
        }
    }

    pub(crate) fn current(&self, kind: EntityKind) -> u64 {
        self.counters
            .get(&kind)
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    pub(crate) fn bump(&self, kind: EntityKind) {
        if let Some(counter) = self.counters.get(&kind) {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Drops cached state in response to source change events.
///
/// Targeted invalidation first; if any step fails, the whole kind is wiped.
pub(crate) struct InvalidationHandler {
    cache: Arc<dyn CacheStorage>,
    registry: Arc<EntityRegistry>,
    generations: Arc<Generations>,
}

impl InvalidationHandler {
    pub(crate) fn new(
        cache: Arc<dyn CacheStorage>,
        registry: Arc<EntityRegistry>,
        generations: Arc<Generations>,
    ) -> Self {
        Self {
            cache,
            registry,
            generations,
        }
    }

    async fn drop_queries(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        drop_queries(self.cache.as_ref(), &self.registry, ctx, kind).await
    }

    async fn drop_entity(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()> {
        match self.cache.delete_by_id(ctx, kind, id).await {
            Ok(()) => {
                debug!(kind = %kind, id, "cached entity invalidated");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn invalidate(&self, ctx: &Context, event: &ChangeEvent) -> StorageResult<()> {
        self.drop_queries(ctx, event.kind).await?;
        match event.mutation {
            Mutation::Create => Ok(()),
            Mutation::Update | Mutation::DeleteById => {
                let id = event.id.as_deref().ok_or_else(|| {
                    StorageError::internal(format!(
                        "{} event for {} carries no id",
                        event.mutation, event.kind
                    ))
                })?;
                self.drop_entity(ctx, event.kind, id).await
            }
            Mutation::DeleteAll => self.cache.delete_all(ctx, event.kind).await,
        }
    }

    async fn wipe(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        wipe_kind(self.cache.as_ref(), &self.registry, ctx, kind).await
    }
}

async fn drop_queries(
    cache: &dyn CacheStorage,
    registry: &EntityRegistry,
    ctx: &Context,
    kind: EntityKind,
) -> StorageResult<()> {
    let dropped = cache
        .delete_cached_queries_for(ctx, registry.tag(kind))
        .await?;
    if dropped > 0 {
        debug!(kind = %kind, dropped, "cached queries invalidated");
    }
    Ok(())
}

/// Drops every cached copy and query row of `kind`.
pub(crate) async fn wipe_kind(
    cache: &dyn CacheStorage,
    registry: &EntityRegistry,
    ctx: &Context,
    kind: EntityKind,
) -> StorageResult<()> {
    let entities = cache.delete_all(ctx, kind).await;
    let queries = drop_queries(cache, registry, ctx, kind).await;
    entities.and(queries)
}

#[async_trait]
impl Subscriber for InvalidationHandler {
    fn name(&self) -> &str {
        "cache-invalidation"
    }

    async fn handle(&self, ctx: &Context, event: &ChangeEvent) -> StorageResult<()> {
        self.generations.bump(event.kind);
        if let Err(err) = self.invalidate(ctx, event).await {
            error!(
                kind = %event.kind,
                mutation = %event.mutation,
                error = %err,
                "targeted cache invalidation failed, wiping kind"
            );
            self.wipe(ctx, event.kind).await?;
        }
        Ok(())
    }

    async fn error(
        &self,
        ctx: &Context,
        kind: EntityKind,
        mutation: Mutation,
        err: StorageError,
    ) -> StorageResult<()> {
        self.generations.bump(kind);
        error!(
            kind = %kind,
            mutation = %mutation,
            error = %err,
            "cache invalidation missed an event, wiping kind"
        );
        self.wipe(ctx, kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCacheStorage;
    use crate::query::{CachedQuery, cache_registry};
    use serde_json::json;
    use toggler_core::Record;

    fn flag(id: &str) -> Record {
        Record::new(EntityKind::ReleaseFlag, json!({"id": id, "name": id})).unwrap()
    }

    async fn seeded() -> (Arc<MemoryCacheStorage>, InvalidationHandler, Arc<Generations>) {
        let cache = Arc::new(MemoryCacheStorage::new());
        let ctx = Context::background();
        cache
            .upsert_many(&ctx, &mut [flag("1"), flag("2")])
            .await
            .unwrap();
        cache
            .store_cached_query(
                &ctx,
                &CachedQuery::new("release_flag:find_all", "release_flag", vec!["1".into(), "2".into()]),
            )
            .await
            .unwrap();
        cache
            .store_cached_query(
                &ctx,
                &CachedQuery::new("security_token:by_hash:x", "security_token", vec![]),
            )
            .await
            .unwrap();
        let generations = Arc::new(Generations::new());
        let handler = InvalidationHandler::new(
            cache.clone(),
            Arc::new(cache_registry()),
            generations.clone(),
        );
        (cache, handler, generations)
    }

    async fn has_flag(cache: &MemoryCacheStorage, id: &str) -> bool {
        cache
            .find_by_id(&Context::background(), EntityKind::ReleaseFlag, id)
            .await
            .unwrap()
            .is_some()
    }

    async fn has_query(cache: &MemoryCacheStorage, id: &str) -> bool {
        cache
            .find_cached_query(&Context::background(), id)
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn test_create_drops_queries_only() {
        let (cache, handler, generations) = seeded().await;
        handler
            .handle(&Context::detached(), &ChangeEvent::created(flag("3")))
            .await
            .unwrap();

        assert!(!has_query(&cache, "release_flag:find_all").await);
        assert!(has_query(&cache, "security_token:by_hash:x").await);
        assert!(has_flag(&cache, "1").await);
        assert_eq!(generations.current(EntityKind::ReleaseFlag), 1);
        assert_eq!(generations.current(EntityKind::Token), 0);
    }

    #[tokio::test]
    async fn test_update_drops_entity_copy() {
        let (cache, handler, _) = seeded().await;
        handler
            .handle(&Context::detached(), &ChangeEvent::updated(flag("1")))
            .await
            .unwrap();

        assert!(!has_flag(&cache, "1").await);
        assert!(has_flag(&cache, "2").await);
        assert!(!has_query(&cache, "release_flag:find_all").await);
    }

    #[tokio::test]
    async fn test_delete_of_uncached_entity_is_clean() {
        let (cache, handler, _) = seeded().await;
        handler
            .handle(
                &Context::detached(),
                &ChangeEvent::deleted(EntityKind::ReleaseFlag, "never-cached"),
            )
            .await
            .unwrap();
        assert!(has_flag(&cache, "1").await);
    }

    #[tokio::test]
    async fn test_delete_all_clears_kind() {
        let (cache, handler, _) = seeded().await;
        handler
            .handle(
                &Context::detached(),
                &ChangeEvent::deleted_all(EntityKind::ReleaseFlag),
            )
            .await
            .unwrap();
        assert!(!has_flag(&cache, "1").await);
        assert!(!has_flag(&cache, "2").await);
        assert!(has_query(&cache, "security_token:by_hash:x").await);
    }

    #[tokio::test]
    async fn test_event_without_id_wipes_kind() {
        let (cache, handler, _) = seeded().await;
        let mut event = ChangeEvent::updated(flag("1"));
        event.id = None;
        handler.handle(&Context::detached(), &event).await.unwrap();
        assert!(!has_flag(&cache, "2").await);
    }

    #[tokio::test]
    async fn test_error_callback_wipes_kind() {
        let (cache, handler, generations) = seeded().await;
        handler
            .error(
                &Context::detached(),
                EntityKind::ReleaseFlag,
                Mutation::Update,
                StorageError::Lagged { skipped: 3 },
            )
            .await
            .unwrap();
        assert!(!has_flag(&cache, "1").await);
        assert!(!has_query(&cache, "release_flag:find_all").await);
        assert_eq!(generations.current(EntityKind::ReleaseFlag), 1);
    }
}
