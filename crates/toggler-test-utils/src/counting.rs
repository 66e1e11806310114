//! A `Storage` wrapper that counts calls per operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use toggler_core::{
    DeploymentEnvironment, EntityKind, Record, ReleaseFlag, ReleasePilot, ReleaseRollout, Token,
};
use toggler_storage::{
    Context, EntityStream, Mutation, RecordStream, Storage, StorageResult, Subscriber,
    Subscription,
};

/// Delegates every call to an inner storage and records how often each
/// operation was invoked.
pub struct CountingStorage {
    inner: Arc<dyn Storage>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl CountingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    /// Number of calls made to `operation`, e.g. `"find_by_id"`.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or_default()
    }

    /// Number of calls across all operations.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, operation: &'static str) {
        *self.calls.lock().entry(operation).or_default() += 1;
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()> {
        self.record("create");
        self.inner.create(ctx, record).await
    }

    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        self.record("find_by_id");
        self.inner.find_by_id(ctx, kind, id).await
    }

    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream> {
        self.record("find_all");
        self.inner.find_all(ctx, kind).await
    }

    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()> {
        self.record("update");
        self.inner.update(ctx, record).await
    }

    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()> {
        self.record("delete_by_id");
        self.inner.delete_by_id(ctx, kind, id).await
    }

    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        self.record("delete_all");
        self.inner.delete_all(ctx, kind).await
    }

    async fn find_release_flag_by_name(
        &self,
        ctx: &Context,
        name: &str,
    ) -> StorageResult<Option<ReleaseFlag>> {
        self.record("find_release_flag_by_name");
        self.inner.find_release_flag_by_name(ctx, name).await
    }

    async fn find_release_flags_by_names(
        &self,
        ctx: &Context,
        names: &[String],
    ) -> StorageResult<EntityStream<ReleaseFlag>> {
        self.record("find_release_flags_by_names");
        self.inner.find_release_flags_by_names(ctx, names).await
    }

    async fn find_release_rollout_by_flag_and_environment(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
    ) -> StorageResult<Option<ReleaseRollout>> {
        self.record("find_release_rollout_by_flag_and_environment");
        self.inner
            .find_release_rollout_by_flag_and_environment(ctx, flag_id, environment_id)
            .await
    }

    async fn find_release_pilot_by_external_id(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> StorageResult<Option<ReleasePilot>> {
        self.record("find_release_pilot_by_external_id");
        self.inner
            .find_release_pilot_by_external_id(ctx, flag_id, environment_id, external_id)
            .await
    }

    async fn find_release_pilots_by_release_flag(
        &self,
        ctx: &Context,
        flag_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        self.record("find_release_pilots_by_release_flag");
        self.inner
            .find_release_pilots_by_release_flag(ctx, flag_id)
            .await
    }

    async fn find_release_pilots_by_external_id(
        &self,
        ctx: &Context,
        external_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        self.record("find_release_pilots_by_external_id");
        self.inner
            .find_release_pilots_by_external_id(ctx, external_id)
            .await
    }

    async fn find_token_by_hash(
        &self,
        ctx: &Context,
        sha512: &str,
    ) -> StorageResult<Option<Token>> {
        self.record("find_token_by_hash");
        self.inner.find_token_by_hash(ctx, sha512).await
    }

    async fn find_deployment_environment_by_alias(
        &self,
        ctx: &Context,
        alias: &str,
    ) -> StorageResult<Option<DeploymentEnvironment>> {
        self.record("find_deployment_environment_by_alias");
        self.inner
            .find_deployment_environment_by_alias(ctx, alias)
            .await
    }

    async fn begin_tx(&self, ctx: &Context) -> StorageResult<Context> {
        self.record("begin_tx");
        self.inner.begin_tx(ctx).await
    }

    async fn commit_tx(&self, ctx: &Context) -> StorageResult<()> {
        self.record("commit_tx");
        self.inner.commit_tx(ctx).await
    }

    async fn rollback_tx(&self, ctx: &Context) -> StorageResult<()> {
        self.record("rollback_tx");
        self.inner.rollback_tx(ctx).await
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        kind: EntityKind,
        mutation: Mutation,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        self.record("subscribe");
        self.inner.subscribe(ctx, kind, mutation, subscriber).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.record("close");
        self.inner.close().await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}
