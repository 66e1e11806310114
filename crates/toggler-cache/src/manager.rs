//! The cache manager: a caching [`Storage`] over a source [`Storage`].
//!
//! Reads are cache-aside. Point lookups go through the entity copies; every
//! domain finder goes through a [`CachedQuery`] row that maps the query
//! fingerprint to hit ids. Writes always go to the source, and the cache
//! learns about them only through the source's change events, so writers
//! that bypass the manager keep the cache correct too.
//!
//! Reads on a context returned by [`begin_tx`](Storage::begin_tx) skip the
//! cache entirely until the transaction is committed or rolled back.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use toggler_core::{
    DeploymentEnvironment, Entity, EntityKind, EntityRegistry, Record, ReleaseFlag, ReleasePilot,
    ReleaseRollout, Token,
};
use toggler_storage::{
    Context, EntityStream, Mutation, RecordStream, Storage, StorageError, StorageResult,
    Subscriber, Subscription, collect, stream_of,
};
use tracing::{debug, error, info, warn};

use crate::invalidation::{Generations, InvalidationHandler, wipe_kind};
use crate::query::{CachedQuery, QueryId};
use crate::storage::{CacheStorage, CacheStorageExt};

const BACKEND_NAME: &str = "cache-manager";

pub struct CacheManager {
    source: Arc<dyn Storage>,
    cache: Arc<dyn CacheStorage>,
    registry: Arc<EntityRegistry>,
    generations: Arc<Generations>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl CacheManager {
    /// Wires a cache in front of `source`.
    ///
    /// Subscribes to every mutation of every domain kind. If one subscription
    /// fails, the ones already made are closed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Configuration` if the registry is incomplete,
    /// or whatever the source returns for a failed subscription.
    pub async fn new(
        ctx: &Context,
        source: Arc<dyn Storage>,
        cache: Arc<dyn CacheStorage>,
        registry: Arc<EntityRegistry>,
    ) -> StorageResult<Self> {
        registry.validate()?;

        let generations = Arc::new(Generations::new());
        let handler: Arc<dyn Subscriber> = Arc::new(InvalidationHandler::new(
            cache.clone(),
            registry.clone(),
            generations.clone(),
        ));

        let mut subscriptions = Vec::with_capacity(EntityKind::DOMAIN.len() * Mutation::ALL.len());
        for kind in EntityKind::DOMAIN {
            for mutation in Mutation::ALL {
                match source.subscribe(ctx, kind, mutation, handler.clone()).await {
                    Ok(subscription) => subscriptions.push(subscription),
                    Err(err) => {
                        for subscription in subscriptions {
                            subscription.close().await;
                        }
                        return Err(err);
                    }
                }
            }
        }

        info!(
            source = source.backend_name(),
            cache = cache.backend_name(),
            subscriptions = subscriptions.len(),
            "cache manager ready"
        );

        Ok(Self {
            source,
            cache,
            registry,
            generations,
            subscriptions: Mutex::new(subscriptions),
        })
    }

    /// The cache storage behind this manager.
    pub fn cache_storage(&self) -> &Arc<dyn CacheStorage> {
        &self.cache
    }

    pub fn source(&self) -> &Arc<dyn Storage> {
        &self.source
    }

    /// `true` while `ctx` belongs to a transaction.
    pub fn bypass_cache(ctx: &Context) -> bool {
        ctx.is_in_transaction() || ctx.open_transaction().is_some()
    }

    fn query(&self, kind: EntityKind, operation: &'static str) -> QueryId {
        QueryId::new(self.registry.tag(kind), operation)
    }

    /// Stores a source value unless the request is gone, then drops it again
    /// if an invalidation of its kind ran meanwhile.
    async fn populate_entity(&self, ctx: &Context, generation: u64, record: Record) {
        if ctx.is_done() {
            return;
        }
        let (kind, id) = (record.kind, record.id.clone());
        if let Err(err) = self.cache.upsert_many(ctx, &mut [record]).await {
            warn!(kind = %kind, id = %id, error = %err, "failed to populate cache");
        }
        if self.generations.current(kind) != generation {
            debug!(kind = %kind, id = %id, "invalidated while populating, discarding");
            self.discard(kind, &[(kind, id)]).await;
        }
    }

    async fn populate_query(
        &self,
        ctx: &Context,
        kind: EntityKind,
        generation: u64,
        fingerprint: &str,
        records: &[Record],
    ) {
        if ctx.is_done() {
            return;
        }
        let mut copies = records.to_vec();
        let row = CachedQuery::new(
            fingerprint,
            self.registry.tag(kind),
            records.iter().map(|record| record.id.clone()).collect(),
        );
        let stored = match self.cache.upsert_many(ctx, &mut copies).await {
            Ok(()) => self.cache.store_cached_query(ctx, &row).await,
            Err(err) => Err(err),
        };
        if let Err(err) = stored {
            warn!(query = %fingerprint, error = %err, "failed to cache query result");
        }
        if self.generations.current(kind) != generation {
            debug!(query = %fingerprint, "invalidated while populating, discarding");
            let mut keys = vec![(EntityKind::CachedQuery, fingerprint.to_string())];
            keys.extend(copies.into_iter().map(|record| (kind, record.id)));
            self.discard(kind, &keys).await;
        }
    }

    /// Deletes values written by a populate that raced an invalidation.
    ///
    /// Runs detached from the request so a cancelled caller cannot leave the
    /// pre-write value behind. A failed delete wipes the whole kind.
    async fn discard(&self, kind: EntityKind, keys: &[(EntityKind, String)]) {
        let ctx = Context::detached();
        for (key_kind, id) in keys {
            match self.cache.delete_by_id(&ctx, *key_kind, id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    error!(
                        kind = %kind,
                        id = %id,
                        error = %err,
                        "failed to discard raced cache population, wiping kind"
                    );
                    if let Err(err) =
                        wipe_kind(self.cache.as_ref(), &self.registry, &ctx, kind).await
                    {
                        error!(kind = %kind, error = %err, "cache wipe failed");
                    }
                    return;
                }
            }
        }
    }

    /// Resolves a cached query row. `Ok(None)` is a miss, including a row
    /// whose hits no longer all resolve; such a row is dropped.
    async fn cached_hits(
        &self,
        ctx: &Context,
        kind: EntityKind,
        fingerprint: &str,
    ) -> StorageResult<Option<Vec<Record>>> {
        let Some(row) = self.cache.find_cached_query(ctx, fingerprint).await? else {
            return Ok(None);
        };
        let hits = self.cache.find_by_ids(ctx, kind, &row.hit_ids).await?;
        match collect(hits).await {
            Ok(records) => Ok(Some(records)),
            Err(err) if err.is_not_found() => {
                debug!(query = %fingerprint, "cached query is stale, recomputing");
                match self
                    .cache
                    .delete_by_id(ctx, EntityKind::CachedQuery, fingerprint)
                    .await
                {
                    Ok(()) => Ok(None),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Serves a query from its cached row, or runs `fetch` against the source
    /// and caches the result. An empty result is cached too.
    async fn cache_query<F>(
        &self,
        ctx: &Context,
        kind: EntityKind,
        query: QueryId,
        fetch: F,
    ) -> StorageResult<Vec<Record>>
    where
        F: Future<Output = StorageResult<Vec<Record>>> + Send,
    {
        if Self::bypass_cache(ctx) {
            return fetch.await;
        }

        let fingerprint = query.render();
        match self.cached_hits(ctx, kind, &fingerprint).await {
            Ok(Some(records)) => {
                debug!(query = %fingerprint, hits = records.len(), "query cache hit");
                return Ok(records);
            }
            Ok(None) => debug!(query = %fingerprint, "query cache miss"),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(query = %fingerprint, error = %err, "query cache read failed, using source");
            }
        }

        let generation = self.generations.current(kind);
        let records = fetch.await?;
        self.populate_query(ctx, kind, generation, &fingerprint, &records)
            .await;
        Ok(records)
    }

    async fn query_many<T, F>(&self, ctx: &Context, query: QueryId, fetch: F) -> StorageResult<Vec<T>>
    where
        T: Entity,
        F: Future<Output = StorageResult<Vec<T>>> + Send,
    {
        let records = self
            .cache_query(ctx, T::KIND, query, async move {
                let entities = fetch.await?;
                entities
                    .iter()
                    .map(|entity| Record::from_entity(entity).map_err(StorageError::from))
                    .collect::<StorageResult<Vec<Record>>>()
            })
            .await?;
        records
            .iter()
            .map(|record| record.decode::<T>().map_err(StorageError::from))
            .collect()
    }

    async fn query_one<T, F>(&self, ctx: &Context, query: QueryId, fetch: F) -> StorageResult<Option<T>>
    where
        T: Entity,
        F: Future<Output = StorageResult<Option<T>>> + Send,
    {
        let found = self
            .query_many(ctx, query, async move {
                Ok::<_, StorageError>(fetch.await?.into_iter().collect::<Vec<T>>())
            })
            .await?;
        Ok(found.into_iter().next())
    }
}

#[async_trait]
impl Storage for CacheManager {
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()> {
        self.source.create(ctx, record).await
    }

    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        if Self::bypass_cache(ctx) || !kind.is_domain() {
            return self.source.find_by_id(ctx, kind, id).await;
        }

        match self.cache.find_by_id(ctx, kind, id).await {
            Ok(Some(record)) => {
                debug!(kind = %kind, id, "cache hit");
                return Ok(Some(record));
            }
            Ok(None) => debug!(kind = %kind, id, "cache miss"),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => warn!(kind = %kind, id, error = %err, "cache read failed, using source"),
        }

        let generation = self.generations.current(kind);
        let found = self.source.find_by_id(ctx, kind, id).await?;
        if let Some(record) = &found {
            self.populate_entity(ctx, generation, record.clone()).await;
        }
        Ok(found)
    }

    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream> {
        if !kind.is_domain() {
            return self.source.find_all(ctx, kind).await;
        }
        let records = self
            .cache_query(ctx, kind, self.query(kind, "find_all"), async {
                collect(self.source.find_all(ctx, kind).await?).await
            })
            .await?;
        Ok(stream_of(records))
    }

    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()> {
        self.source.update(ctx, record).await
    }

    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()> {
        self.source.delete_by_id(ctx, kind, id).await
    }

    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        self.source.delete_all(ctx, kind).await
    }

    async fn find_release_flag_by_name(
        &self,
        ctx: &Context,
        name: &str,
    ) -> StorageResult<Option<ReleaseFlag>> {
        self.query_one(
            ctx,
            self.query(EntityKind::ReleaseFlag, "by_name").param(name),
            self.source.find_release_flag_by_name(ctx, name),
        )
        .await
    }

    async fn find_release_flags_by_names(
        &self,
        ctx: &Context,
        names: &[String],
    ) -> StorageResult<EntityStream<ReleaseFlag>> {
        let flags = self
            .query_many(
                ctx,
                self.query(EntityKind::ReleaseFlag, "by_names")
                    .params_sorted(names),
                async { collect(self.source.find_release_flags_by_names(ctx, names).await?).await },
            )
            .await?;
        Ok(stream_of(flags))
    }

    async fn find_release_rollout_by_flag_and_environment(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
    ) -> StorageResult<Option<ReleaseRollout>> {
        self.query_one(
            ctx,
            self.query(EntityKind::ReleaseRollout, "by_flag_and_environment")
                .param(flag_id)
                .param(environment_id),
            self.source
                .find_release_rollout_by_flag_and_environment(ctx, flag_id, environment_id),
        )
        .await
    }

    async fn find_release_pilot_by_external_id(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> StorageResult<Option<ReleasePilot>> {
        self.query_one(
            ctx,
            self.query(EntityKind::ReleasePilot, "by_flag_environment_and_external_id")
                .param(flag_id)
                .param(environment_id)
                .param(external_id),
            self.source
                .find_release_pilot_by_external_id(ctx, flag_id, environment_id, external_id),
        )
        .await
    }

    async fn find_release_pilots_by_release_flag(
        &self,
        ctx: &Context,
        flag_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        let pilots = self
            .query_many(
                ctx,
                self.query(EntityKind::ReleasePilot, "by_release_flag")
                    .param(flag_id),
                async {
                    collect(
                        self.source
                            .find_release_pilots_by_release_flag(ctx, flag_id)
                            .await?,
                    )
                    .await
                },
            )
            .await?;
        Ok(stream_of(pilots))
    }

    async fn find_release_pilots_by_external_id(
        &self,
        ctx: &Context,
        external_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        let pilots = self
            .query_many(
                ctx,
                self.query(EntityKind::ReleasePilot, "by_external_id")
                    .param(external_id),
                async {
                    collect(
                        self.source
                            .find_release_pilots_by_external_id(ctx, external_id)
                            .await?,
                    )
                    .await
                },
            )
            .await?;
        Ok(stream_of(pilots))
    }

    async fn find_token_by_hash(&self, ctx: &Context, sha512: &str) -> StorageResult<Option<Token>> {
        self.query_one(
            ctx,
            self.query(EntityKind::Token, "by_hash").param(sha512),
            self.source.find_token_by_hash(ctx, sha512),
        )
        .await
    }

    async fn find_deployment_environment_by_alias(
        &self,
        ctx: &Context,
        alias: &str,
    ) -> StorageResult<Option<DeploymentEnvironment>> {
        self.query_one(
            ctx,
            self.query(EntityKind::DeploymentEnvironment, "by_alias")
                .param(alias),
            self.source.find_deployment_environment_by_alias(ctx, alias),
        )
        .await
    }

    async fn begin_tx(&self, ctx: &Context) -> StorageResult<Context> {
        let tx_ctx = self.source.begin_tx(ctx).await?;
        Ok(tx_ctx.mark_in_transaction())
    }

    async fn commit_tx(&self, ctx: &Context) -> StorageResult<()> {
        let result = self.source.commit_tx(ctx).await;
        ctx.clear_transaction_marker();
        result
    }

    async fn rollback_tx(&self, ctx: &Context) -> StorageResult<()> {
        let result = self.source.rollback_tx(ctx).await;
        ctx.clear_transaction_marker();
        result
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        kind: EntityKind,
        mutation: Mutation,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        self.source.subscribe(ctx, kind, mutation, subscriber).await
    }

    async fn close(&self) -> StorageResult<()> {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.close().await;
        }
        let cache = self.cache.close().await;
        let source = self.source.close().await;
        debug!("cache manager closed");
        cache.and(source)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }
}
