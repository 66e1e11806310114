//! Pass-through used when no cache backend is configured.

use std::sync::Arc;

use async_trait::async_trait;
use toggler_core::{
    DeploymentEnvironment, EntityKind, Record, ReleaseFlag, ReleasePilot, ReleaseRollout, Token,
};
use toggler_storage::{
    Context, EntityStream, Mutation, RecordStream, Storage, StorageResult, Subscriber,
    Subscription,
};

const BACKEND_NAME: &str = "null-cache";

/// A [`Storage`] that forwards every call to its source.
pub struct NullCache {
    source: Arc<dyn Storage>,
}

impl NullCache {
    pub fn new(source: Arc<dyn Storage>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn Storage> {
        &self.source
    }
}

#[async_trait]
impl Storage for NullCache {
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()> {
        self.source.create(ctx, record).await
    }

    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        self.source.find_by_id(ctx, kind, id).await
    }

    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream> {
        self.source.find_all(ctx, kind).await
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
        self.source.find_release_flag_by_name(ctx, name).await
    }

    async fn find_release_flags_by_names(
        &self,
        ctx: &Context,
        names: &[String],
    ) -> StorageResult<EntityStream<ReleaseFlag>> {
        self.source.find_release_flags_by_names(ctx, names).await
    }

    async fn find_release_rollout_by_flag_and_environment(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
    ) -> StorageResult<Option<ReleaseRollout>> {
        self.source
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
        self.source
            .find_release_pilot_by_external_id(ctx, flag_id, environment_id, external_id)
            .await
    }

    async fn find_release_pilots_by_release_flag(
        &self,
        ctx: &Context,
        flag_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        self.source
            .find_release_pilots_by_release_flag(ctx, flag_id)
            .await
    }

    async fn find_release_pilots_by_external_id(
        &self,
        ctx: &Context,
        external_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        self.source
            .find_release_pilots_by_external_id(ctx, external_id)
            .await
    }

    async fn find_token_by_hash(&self, ctx: &Context, sha512: &str) -> StorageResult<Option<Token>> {
        self.source.find_token_by_hash(ctx, sha512).await
    }

    async fn find_deployment_environment_by_alias(
        &self,
        ctx: &Context,
        alias: &str,
    ) -> StorageResult<Option<DeploymentEnvironment>> {
        self.source
            .find_deployment_environment_by_alias(ctx, alias)
            .await
    }

    async fn begin_tx(&self, ctx: &Context) -> StorageResult<Context> {
        self.source.begin_tx(ctx).await
    }

    async fn commit_tx(&self, ctx: &Context) -> StorageResult<()> {
        self.source.commit_tx(ctx).await
    }

    async fn rollback_tx(&self, ctx: &Context) -> StorageResult<()> {
        self.source.rollback_tx(ctx).await
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
        self.source.close().await
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }
}
