//! Black-box contract suite for [`Storage`] implementations.
//!
//! Every check uses fresh names and ids, so the suite can run against a
//! storage that already holds data. Checks panic on violation.
//!
//! ```ignore
//! #[tokio::test]
//! async fn in_memory_storage_satisfies_contract() {
//!     let storage = InMemoryStorage::new();
//!     toggler_test_utils::contract::run_all(&storage).await;
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use toggler_core::{
    DeploymentEnvironment, EntityKind, Record, ReleaseFlag, ReleasePilot, ReleaseRollout,
    RolloutPlan, Token, new_entity_id,
};
use toggler_storage::{
    ChangeEvent, Context, Mutation, Storage, StorageError, StorageExt, StorageResult, Subscriber,
    collect,
};

use crate::fixtures::{environment, flag, percentage_rollout, pilot, token, unique_name};

/// Runs every contract check in sequence.
pub async fn run_all(storage: &dyn Storage) {
    create_assigns_id_and_round_trips(storage).await;
    create_keeps_caller_id(storage).await;
    create_duplicate_fails(storage).await;
    find_missing_is_not_an_error(storage).await;
    update_replaces_value(storage).await;
    update_missing_fails(storage).await;
    delete_by_id_removes_value(storage).await;
    delete_missing_fails(storage).await;
    find_all_returns_every_entity(storage).await;
    delete_all_is_scoped_to_kind(storage).await;
    release_flag_finders(storage).await;
    release_rollout_finder(storage).await;
    release_pilot_finders(storage).await;
    token_finder(storage).await;
    deployment_environment_finder(storage).await;
    transaction_commit_makes_writes_visible(storage).await;
    transaction_rollback_discards_writes(storage).await;
    nested_transaction_fails(storage).await;
    subscriptions_receive_committed_changes(storage).await;
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn create_assigns_id_and_round_trips(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut created = flag(unique_name("flag"));
    storage.create_entity(&ctx, &mut created).await.unwrap();
    assert!(!created.id.is_empty(), "create must assign an id");

    let found: Option<ReleaseFlag> = storage.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(found, Some(created));
}

pub async fn create_keeps_caller_id(storage: &dyn Storage) {
    let ctx = Context::background();
    let id = new_entity_id();
    let mut record = Record::from_entity(&flag(unique_name("flag")).with_id(id.clone())).unwrap();
    storage.create(&ctx, &mut record).await.unwrap();
    assert_eq!(record.id, id);
    assert!(
        storage
            .find_by_id(&ctx, EntityKind::ReleaseFlag, &id)
            .await
            .unwrap()
            .is_some()
    );
}

pub async fn create_duplicate_fails(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut created = environment(unique_name("env"));
    storage.create_entity(&ctx, &mut created).await.unwrap();

    let mut duplicate = created.clone();
    let err = storage.create_entity(&ctx, &mut duplicate).await.unwrap_err();
    assert!(err.is_already_exists(), "expected AlreadyExists, got {err:?}");
}

pub async fn find_missing_is_not_an_error(storage: &dyn Storage) {
    let ctx = Context::background();
    let found = storage
        .find_by_id(&ctx, EntityKind::ReleaseRollout, &new_entity_id())
        .await
        .unwrap();
    assert!(found.is_none());
}

pub async fn update_replaces_value(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut rollout = percentage_rollout(&new_entity_id(), &new_entity_id(), 50);
    storage.create_entity(&ctx, &mut rollout).await.unwrap();

    // Read once so caching layers hold the old value.
    let _: Option<ReleaseRollout> = storage.find_entity(&ctx, &rollout.id).await.unwrap();

    rollout.plan = RolloutPlan::percentage(42, 75);
    storage.update_entity(&ctx, &rollout).await.unwrap();

    let found: Option<ReleaseRollout> = storage.find_entity(&ctx, &rollout.id).await.unwrap();
    assert_eq!(found, Some(rollout));
}

pub async fn update_missing_fails(storage: &dyn Storage) {
    let ctx = Context::background();
    let missing = flag(unique_name("flag")).with_id(new_entity_id());
    let err = storage.update_entity(&ctx, &missing).await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
}

pub async fn delete_by_id_removes_value(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut created = flag(unique_name("flag"));
    storage.create_entity(&ctx, &mut created).await.unwrap();
    let _: Option<ReleaseFlag> = storage.find_entity(&ctx, &created.id).await.unwrap();

    storage
        .delete_entity::<ReleaseFlag>(&ctx, &created.id)
        .await
        .unwrap();
    let found: Option<ReleaseFlag> = storage.find_entity(&ctx, &created.id).await.unwrap();
    assert!(found.is_none());
}

pub async fn delete_missing_fails(storage: &dyn Storage) {
    let ctx = Context::background();
    let err = storage
        .delete_by_id(&ctx, EntityKind::Token, &new_entity_id())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
}

pub async fn find_all_returns_every_entity(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut ids = BTreeSet::new();
    for _ in 0..3 {
        let mut created = pilot(&new_entity_id(), &new_entity_id(), &unique_name("user"));
        storage.create_entity(&ctx, &mut created).await.unwrap();
        ids.insert(created.id);
    }

    let all: Vec<ReleasePilot> = storage.find_all_entities(&ctx).await.unwrap();
    let found: BTreeSet<String> = all.into_iter().map(|p| p.id).collect();
    assert!(ids.is_subset(&found), "find_all must return every created entity");

    // A second call re-reads.
    let again: Vec<ReleasePilot> = storage.find_all_entities(&ctx).await.unwrap();
    assert_eq!(again.len(), found.len());
}

pub async fn delete_all_is_scoped_to_kind(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut doomed = token(unique_name("hash"));
    storage.create_entity(&ctx, &mut doomed).await.unwrap();
    let mut survivor = environment(unique_name("env"));
    storage.create_entity(&ctx, &mut survivor).await.unwrap();
    let _: Vec<Token> = storage.find_all_entities(&ctx).await.unwrap();

    storage.delete_all_entities::<Token>(&ctx).await.unwrap();

    let tokens: Vec<Token> = storage.find_all_entities(&ctx).await.unwrap();
    assert!(tokens.is_empty());
    let found: Option<Token> = storage.find_entity(&ctx, &doomed.id).await.unwrap();
    assert!(found.is_none());
    let env: Option<DeploymentEnvironment> =
        storage.find_entity(&ctx, &survivor.id).await.unwrap();
    assert_eq!(env, Some(survivor));

    // Deleting from an empty kind succeeds.
    storage.delete_all_entities::<Token>(&ctx).await.unwrap();
}

pub async fn release_flag_finders(storage: &dyn Storage) {
    let ctx = Context::background();
    let names: Vec<String> = (0..3).map(|_| unique_name("flag")).collect();
    for name in &names {
        let mut created = flag(name.clone());
        storage.create_entity(&ctx, &mut created).await.unwrap();
    }

    let found = storage
        .find_release_flag_by_name(&ctx, &names[1])
        .await
        .unwrap()
        .expect("flag by name");
    assert_eq!(found.name, names[1]);
    assert!(
        storage
            .find_release_flag_by_name(&ctx, &unique_name("absent"))
            .await
            .unwrap()
            .is_none()
    );

    let forward = flag_names(storage, &ctx, names.clone()).await;
    let mut reversed_query = names.clone();
    reversed_query.reverse();
    let reversed = flag_names(storage, &ctx, reversed_query).await;
    let expected: BTreeSet<String> = names.iter().cloned().collect();
    assert_eq!(forward, expected);
    assert_eq!(reversed, expected);

    let none = flag_names(storage, &ctx, vec![unique_name("absent")]).await;
    assert!(none.is_empty());
}

async fn flag_names(storage: &dyn Storage, ctx: &Context, names: Vec<String>) -> BTreeSet<String> {
    let stream = storage
        .find_release_flags_by_names(ctx, &names)
        .await
        .unwrap();
    collect(stream)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect()
}

pub async fn release_rollout_finder(storage: &dyn Storage) {
    let ctx = Context::background();
    let (flag_id, env_id) = (new_entity_id(), new_entity_id());
    let mut created = percentage_rollout(&flag_id, &env_id, 10);
    storage.create_entity(&ctx, &mut created).await.unwrap();

    let found = storage
        .find_release_rollout_by_flag_and_environment(&ctx, &flag_id, &env_id)
        .await
        .unwrap();
    assert_eq!(found, Some(created));

    let other = storage
        .find_release_rollout_by_flag_and_environment(&ctx, &flag_id, &new_entity_id())
        .await
        .unwrap();
    assert!(other.is_none());
}

pub async fn release_pilot_finders(storage: &dyn Storage) {
    let ctx = Context::background();
    let (flag_id, env_id) = (new_entity_id(), new_entity_id());
    let external = unique_name("user");
    let mut first = pilot(&flag_id, &env_id, &external);
    storage.create_entity(&ctx, &mut first).await.unwrap();
    let mut second = pilot(&flag_id, &env_id, &unique_name("user"));
    storage.create_entity(&ctx, &mut second).await.unwrap();
    let mut elsewhere = pilot(&new_entity_id(), &env_id, &external);
    storage.create_entity(&ctx, &mut elsewhere).await.unwrap();

    let found = storage
        .find_release_pilot_by_external_id(&ctx, &flag_id, &env_id, &external)
        .await
        .unwrap();
    assert_eq!(found, Some(first.clone()));

    let by_flag: BTreeSet<String> = collect(
        storage
            .find_release_pilots_by_release_flag(&ctx, &flag_id)
            .await
            .unwrap(),
    )
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.id)
    .collect();
    assert_eq!(by_flag, BTreeSet::from([first.id.clone(), second.id.clone()]));

    let by_external: BTreeSet<String> = collect(
        storage
            .find_release_pilots_by_external_id(&ctx, &external)
            .await
            .unwrap(),
    )
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.id)
    .collect();
    assert_eq!(by_external, BTreeSet::from([first.id, elsewhere.id]));
}

pub async fn token_finder(storage: &dyn Storage) {
    let ctx = Context::background();
    let hash = unique_name("sha512");
    let mut created = token(hash.clone());
    storage.create_entity(&ctx, &mut created).await.unwrap();

    let found = storage.find_token_by_hash(&ctx, &hash).await.unwrap();
    assert_eq!(found.map(|t| t.id), Some(created.id));
    assert!(
        storage
            .find_token_by_hash(&ctx, &unique_name("sha512"))
            .await
            .unwrap()
            .is_none()
    );
}

pub async fn deployment_environment_finder(storage: &dyn Storage) {
    let ctx = Context::background();
    let name = unique_name("env");
    let mut created = environment(name.clone());
    storage.create_entity(&ctx, &mut created).await.unwrap();

    let by_name = storage
        .find_deployment_environment_by_alias(&ctx, &name)
        .await
        .unwrap();
    assert_eq!(by_name, Some(created.clone()));
    let by_id = storage
        .find_deployment_environment_by_alias(&ctx, &created.id)
        .await
        .unwrap();
    assert_eq!(by_id, Some(created));
}

pub async fn transaction_commit_makes_writes_visible(storage: &dyn Storage) {
    let ctx = Context::background();
    let tx = storage.begin_tx(&ctx).await.unwrap();
    let mut created = flag(unique_name("flag"));
    storage.create_entity(&tx, &mut created).await.unwrap();

    let inside: Option<ReleaseFlag> = storage.find_entity(&tx, &created.id).await.unwrap();
    assert_eq!(inside.as_ref(), Some(&created));

    storage.commit_tx(&tx).await.unwrap();
    let after: Option<ReleaseFlag> = storage.find_entity(&ctx, &created.id).await.unwrap();
    assert_eq!(after, Some(created));
}

pub async fn transaction_rollback_discards_writes(storage: &dyn Storage) {
    let ctx = Context::background();
    let mut existing = flag(unique_name("flag"));
    storage.create_entity(&ctx, &mut existing).await.unwrap();

    let tx = storage.begin_tx(&ctx).await.unwrap();
    let mut renamed = existing.clone();
    renamed.name = unique_name("renamed");
    storage.update_entity(&tx, &renamed).await.unwrap();
    let inside: Option<ReleaseFlag> = storage.find_entity(&tx, &existing.id).await.unwrap();
    assert_eq!(inside, Some(renamed));

    storage.rollback_tx(&tx).await.unwrap();
    let after: Option<ReleaseFlag> = storage.find_entity(&ctx, &existing.id).await.unwrap();
    assert_eq!(after, Some(existing));
}

pub async fn nested_transaction_fails(storage: &dyn Storage) {
    let ctx = Context::background();
    let tx = storage.begin_tx(&ctx).await.unwrap();
    let nested = storage.begin_tx(&tx).await;
    assert!(
        matches!(nested, Err(StorageError::TransactionError { .. })),
        "nested begin_tx must fail"
    );
    storage.rollback_tx(&tx).await.unwrap();
}

struct CountingSubscriber {
    handled: AtomicUsize,
    ids: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl Subscriber for CountingSubscriber {
    fn name(&self) -> &str {
        "contract"
    }

    async fn handle(&self, _ctx: &Context, event: &ChangeEvent) -> StorageResult<()> {
        if let Some(id) = &event.id {
            self.ids.lock().push(id.clone());
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn error(
        &self,
        _ctx: &Context,
        _kind: EntityKind,
        _mutation: Mutation,
        _err: StorageError,
    ) -> StorageResult<()> {
        Ok(())
    }
}

pub async fn subscriptions_receive_committed_changes(storage: &dyn Storage) {
    let ctx = Context::background();
    let subscriber = Arc::new(CountingSubscriber {
        handled: AtomicUsize::new(0),
        ids: parking_lot::Mutex::new(Vec::new()),
    });
    let subscription = storage
        .subscribe_to_update(&ctx, EntityKind::DeploymentEnvironment, subscriber.clone())
        .await
        .unwrap();

    let mut created = environment(unique_name("env"));
    storage.create_entity(&ctx, &mut created).await.unwrap();
    created.name = unique_name("env");
    storage.update_entity(&ctx, &created).await.unwrap();

    let id = created.id.clone();
    assert!(
        eventually(|| subscriber.ids.lock().contains(&id)).await,
        "update subscriber was not notified"
    );

    subscription.close().await;
    let seen = subscriber.handled.load(Ordering::SeqCst);
    created.name = unique_name("env");
    storage.update_entity(&ctx, &created).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subscriber.handled.load(Ordering::SeqCst), seen);
}
