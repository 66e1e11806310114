//! Cache manager behavior over the in-memory source and cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use toggler_cache::{
    CacheManager, CacheStorage, CacheStorageExt, MemoryCacheStorage, NullCache, cache_registry,
};
use toggler_core::{
    DeploymentEnvironment, EntityKind, Record, ReleaseFlag, ReleaseRollout, RolloutPlan, Token,
};
use toggler_db_memory::InMemoryStorage;
use toggler_storage::{
    Context, DeliveryMode, RecordStream, Storage, StorageError, StorageExt, StorageResult,
    collect,
};
use toggler_test_utils::fixtures::{environment, flag, percentage_rollout, token, unique_name};
use toggler_test_utils::{CountingStorage, contract};

struct Harness {
    manager: CacheManager,
    source: Arc<CountingStorage>,
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryCacheStorage::new())).await
}

async fn harness_with(cache: Arc<dyn CacheStorage>) -> Harness {
    let source = Arc::new(CountingStorage::new(Arc::new(InMemoryStorage::new())));
    let manager = CacheManager::new(
        &Context::background(),
        source.clone(),
        cache,
        Arc::new(cache_registry()),
    )
    .await
    .unwrap();
    Harness { manager, source }
}

#[tokio::test]
async fn cache_manager_satisfies_contract() {
    let h = harness().await;
    contract::run_all(&h.manager).await;
    h.manager.close().await.unwrap();
}

#[tokio::test]
async fn null_cache_satisfies_contract() {
    let storage = NullCache::new(Arc::new(InMemoryStorage::new()));
    contract::run_all(&storage).await;
}

#[tokio::test]
async fn repeated_point_lookups_hit_source_once() {
    let h = harness().await;
    let ctx = Context::background();
    let mut created = flag(unique_name("flag"));
    h.manager.create_entity(&ctx, &mut created).await.unwrap();
    h.source.reset();

    for _ in 0..5 {
        let found: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
        assert_eq!(found.as_ref(), Some(&created));
    }
    assert_eq!(h.source.calls("find_by_id"), 1);
}

#[tokio::test]
async fn repeated_finder_queries_hit_source_once() {
    let h = harness().await;
    let ctx = Context::background();
    let name = unique_name("flag");
    let mut created = flag(name.clone());
    h.manager.create_entity(&ctx, &mut created).await.unwrap();
    h.source.reset();

    for _ in 0..5 {
        let found = h
            .manager
            .find_release_flag_by_name(&ctx, &name)
            .await
            .unwrap();
        assert_eq!(found.as_ref(), Some(&created));
    }
    assert_eq!(h.source.calls("find_release_flag_by_name"), 1);
}

#[tokio::test]
async fn name_list_order_does_not_matter() {
    let h = harness().await;
    let ctx = Context::background();
    let names: Vec<String> = (0..3).map(|_| unique_name("flag")).collect();
    for name in &names {
        h.manager
            .create_entity(&ctx, &mut flag(name.clone()))
            .await
            .unwrap();
    }
    h.source.reset();

    let forward = collect(
        h.manager
            .find_release_flags_by_names(&ctx, &names)
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    let mut reversed = names.clone();
    reversed.reverse();
    let backward = collect(
        h.manager
            .find_release_flags_by_names(&ctx, &reversed)
            .await
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(forward.len(), 3);
    assert_eq!(forward, backward);
    assert_eq!(h.source.calls("find_release_flags_by_names"), 1);
}

#[tokio::test]
async fn empty_name_list_and_blank_name_are_distinct_queries() {
    let h = harness().await;
    let ctx = Context::background();
    let lists = [Vec::new(), vec![String::new()]];

    for _ in 0..2 {
        for names in &lists {
            let found = collect(
                h.manager
                    .find_release_flags_by_names(&ctx, names)
                    .await
                    .unwrap(),
            )
            .await
            .unwrap();
            assert!(found.is_empty());
        }
    }
    assert_eq!(h.source.calls("find_release_flags_by_names"), 2);
}

#[tokio::test]
async fn empty_results_are_cached() {
    let h = harness().await;
    let ctx = Context::background();
    let name = unique_name("absent");

    for _ in 0..3 {
        assert!(
            h.manager
                .find_release_flag_by_name(&ctx, &name)
                .await
                .unwrap()
                .is_none()
        );
    }
    assert_eq!(h.source.calls("find_release_flag_by_name"), 1);

    let row = h
        .manager
        .cache_storage()
        .find_cached_query(&ctx, &format!("release_flag:by_name:{name}"))
        .await
        .unwrap()
        .expect("negative result row");
    assert!(row.hit_ids.is_empty());

    // A create of the kind drops the negative result.
    let mut created = flag(name.clone());
    h.manager.create_entity(&ctx, &mut created).await.unwrap();
    let found = h
        .manager
        .find_release_flag_by_name(&ctx, &name)
        .await
        .unwrap();
    assert_eq!(found, Some(created));
}

#[tokio::test]
async fn update_invalidates_cached_copy() {
    let h = harness().await;
    let ctx = Context::background();
    let mut created = flag(unique_name("flag"));
    h.manager.create_entity(&ctx, &mut created).await.unwrap();
    let _: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();

    // Write straight to the source; the manager only learns about it
    // through change events.
    created.name = unique_name("renamed");
    h.source.update_entity(&ctx, &created).await.unwrap();

    let found: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(found, Some(created));
}

#[tokio::test]
async fn delete_invalidates_cached_copy() {
    let h = harness().await;
    let ctx = Context::background();
    let mut created = token(unique_name("sha"));
    h.manager.create_entity(&ctx, &mut created).await.unwrap();
    assert!(
        h.manager
            .find_token_by_hash(&ctx, &created.sha512)
            .await
            .unwrap()
            .is_some()
    );
    let _: Option<Token> = h.manager.find_entity(&ctx, &created.id).await.unwrap();

    h.manager
        .delete_entity::<Token>(&ctx, &created.id)
        .await
        .unwrap();

    let by_id: Option<Token> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
    assert!(by_id.is_none());
    assert!(
        h.manager
            .find_token_by_hash(&ctx, &created.sha512)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn delete_all_invalidates_every_copy_and_query() {
    let h = harness().await;
    let ctx = Context::background();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let mut created = environment(unique_name("env"));
        h.manager.create_entity(&ctx, &mut created).await.unwrap();
        let _: Option<DeploymentEnvironment> =
            h.manager.find_entity(&ctx, &created.id).await.unwrap();
        ids.push(created.id);
    }
    let all: Vec<DeploymentEnvironment> =
        h.manager.find_all_entities(&ctx).await.unwrap();
    assert_eq!(all.len(), 3);

    h.manager
        .delete_all_entities::<DeploymentEnvironment>(&ctx)
        .await
        .unwrap();

    let all: Vec<DeploymentEnvironment> =
        h.manager.find_all_entities(&ctx).await.unwrap();
    assert!(all.is_empty());
    for id in &ids {
        let found: Option<DeploymentEnvironment> =
            h.manager.find_entity(&ctx, id).await.unwrap();
        assert!(found.is_none());
    }
    let rows = h
        .manager
        .cache_storage()
        .cached_queries_for(&ctx, "deployment_environment")
        .await
        .unwrap();
    assert!(rows.iter().all(|row| row.hit_ids.is_empty()));
}

#[tokio::test]
async fn transaction_reads_bypass_cache() {
    let h = harness().await;
    let ctx = Context::background();
    let mut created = flag(unique_name("flag"));
    h.manager.create_entity(&ctx, &mut created).await.unwrap();
    let _: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();

    let tx = h.manager.begin_tx(&ctx).await.unwrap();
    let mut renamed = created.clone();
    renamed.name = unique_name("renamed");
    h.manager.update_entity(&tx, &renamed).await.unwrap();

    h.source.reset();
    let inside: Option<ReleaseFlag> = h.manager.find_entity(&tx, &created.id).await.unwrap();
    assert_eq!(inside.as_ref(), Some(&renamed));
    let inside_again: Option<ReleaseFlag> =
        h.manager.find_entity(&tx, &created.id).await.unwrap();
    assert_eq!(inside_again.as_ref(), Some(&renamed));
    assert_eq!(h.source.calls("find_by_id"), 2);

    // Outside the transaction the committed value is still cached.
    let outside: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(outside.as_ref(), Some(&created));

    h.manager.commit_tx(&tx).await.unwrap();
    let after: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(after, Some(renamed));
}

async fn rollout_for(manager: &CacheManager, flag_id: &str, environment_id: &str) -> ReleaseRollout {
    manager
        .find_release_rollout_by_flag_and_environment(&Context::background(), flag_id, environment_id)
        .await
        .unwrap()
        .expect("rollout")
}

#[tokio::test]
async fn rollout_percentage_change_is_visible() {
    let h = harness().await;
    let ctx = Context::background();
    let mut checkout = flag(unique_name("checkout-v2"));
    h.manager.create_entity(&ctx, &mut checkout).await.unwrap();
    let mut production = environment(unique_name("production"));
    h.manager
        .create_entity(&ctx, &mut production)
        .await
        .unwrap();
    let mut rollout = percentage_rollout(&checkout.id, &production.id, 50);
    h.manager.create_entity(&ctx, &mut rollout).await.unwrap();
    h.source.reset();

    let first = rollout_for(&h.manager, &checkout.id, &production.id).await;
    assert_eq!(first.plan, RolloutPlan::percentage(42, 50));
    let _ = rollout_for(&h.manager, &checkout.id, &production.id).await;
    assert_eq!(
        h.source.calls("find_release_rollout_by_flag_and_environment"),
        1
    );

    rollout.plan = RolloutPlan::percentage(42, 75);
    h.manager.update_entity(&ctx, &rollout).await.unwrap();

    let after = rollout_for(&h.manager, &checkout.id, &production.id).await;
    assert_eq!(after.plan, RolloutPlan::percentage(42, 75));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_delivery_invalidates_eventually() {
    let source = Arc::new(InMemoryStorage::with_delivery(DeliveryMode::background()));
    let manager = CacheManager::new(
        &Context::background(),
        source.clone(),
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(cache_registry()),
    )
    .await
    .unwrap();
    let ctx = Context::background();

    let mut created = flag(unique_name("flag"));
    manager.create_entity(&ctx, &mut created).await.unwrap();
    let _: Option<ReleaseFlag> = manager.find_entity(&ctx, &created.id).await.unwrap();

    created.name = unique_name("renamed");
    manager.update_entity(&ctx, &created).await.unwrap();

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let found: Option<ReleaseFlag> = manager.find_entity(&ctx, &created.id).await.unwrap();
            if found.as_ref() == Some(&created) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "update never became visible");

    manager.close().await.unwrap();
}

#[tokio::test]
async fn close_closes_source_once() {
    let h = harness().await;
    h.manager.close().await.unwrap();
    assert_eq!(h.source.calls("close"), 1);
    assert_eq!(h.source.calls("subscribe"), 20);
}

/// A cache whose every operation fails.
struct BrokenCache;

fn broken() -> StorageError {
    StorageError::connection_error("cache unavailable")
}

#[async_trait]
impl CacheStorage for BrokenCache {
    async fn create(&self, _ctx: &Context, _record: &mut Record) -> StorageResult<()> {
        Err(broken())
    }

    async fn find_by_id(
        &self,
        _ctx: &Context,
        _kind: EntityKind,
        _id: &str,
    ) -> StorageResult<Option<Record>> {
        Err(broken())
    }

    async fn find_all(&self, _ctx: &Context, _kind: EntityKind) -> StorageResult<RecordStream> {
        Err(broken())
    }

    async fn update(&self, _ctx: &Context, _record: &Record) -> StorageResult<()> {
        Err(broken())
    }

    async fn delete_by_id(&self, _ctx: &Context, _kind: EntityKind, _id: &str) -> StorageResult<()> {
        Err(broken())
    }

    async fn delete_all(&self, _ctx: &Context, _kind: EntityKind) -> StorageResult<()> {
        Err(broken())
    }

    async fn upsert_many(&self, _ctx: &Context, _records: &mut [Record]) -> StorageResult<()> {
        Err(broken())
    }

    async fn find_by_ids(
        &self,
        _ctx: &Context,
        _kind: EntityKind,
        _ids: &[String],
    ) -> StorageResult<RecordStream> {
        Err(broken())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn broken_cache_degrades_to_source() {
    let h = harness_with(Arc::new(BrokenCache)).await;
    let ctx = Context::background();
    let name = unique_name("flag");
    let mut created = flag(name.clone());

    // Writes succeed even though invalidation cannot reach the cache.
    h.manager.create_entity(&ctx, &mut created).await.unwrap();

    let by_id: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(by_id.as_ref(), Some(&created));
    let by_name = h
        .manager
        .find_release_flag_by_name(&ctx, &name)
        .await
        .unwrap();
    assert_eq!(by_name, Some(created.clone()));

    created.name = unique_name("renamed");
    h.manager.update_entity(&ctx, &created).await.unwrap();
    let by_id: Option<ReleaseFlag> = h.manager.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(by_id, Some(created));
}
