use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use papaya::HashMap as PapayaHashMap;
use parking_lot::Mutex;
use toggler_core::{
    DeploymentEnvironment, Entity, EntityKind, Record, ReleaseFlag, ReleasePilot, ReleaseRollout,
    Token,
};
use toggler_storage::{
    ChangeEvent, Context, DeliveryMode, EntityStream, EventBus, Mutation, RecordStream, Storage,
    StorageError, StorageResult, Subscriber, Subscription, TransactionHandle, stream_of,
};
use tracing::debug;
use uuid::Uuid;

use crate::transaction::{PendingTransaction, TxOp};

pub type StorageKey = String; // Format: "entity_tag/id"

pub(crate) fn make_storage_key(kind: EntityKind, id: &str) -> StorageKey {
    format!("{}/{id}", kind.tag())
}

const BACKEND_NAME: &str = "in-memory-papaya";

/// In-memory source storage backed by a papaya lock-free HashMap.
///
/// This storage implementation provides:
/// - Lock-free concurrent reads via `papaya::HashMap`
/// - Full CRUD operations and the domain finders
/// - One-phase transactions with staged writes
/// - Change events published after every committed write
#[derive(Debug)]
pub struct InMemoryStorage {
    /// Committed entities keyed by `"tag/id"`.
    pub(crate) data: Arc<PapayaHashMap<StorageKey, Record>>,
    /// Serializes check-then-write sequences. Never held across an await.
    write_lock: Mutex<()>,
    /// Staged writes of open transactions.
    transactions: Mutex<HashMap<Uuid, PendingTransaction>>,
    events: EventBus,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Creates a storage that delivers change events synchronously.
    pub fn new() -> Self {
        Self::with_delivery(DeliveryMode::Synchronous)
    }

    /// Creates a storage with the given event delivery mode.
    pub fn with_delivery(mode: DeliveryMode) -> Self {
        Self {
            data: Arc::new(PapayaHashMap::new()),
            write_lock: Mutex::new(()),
            transactions: Mutex::new(HashMap::new()),
            events: EventBus::new(mode),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Number of committed entities of a kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        let prefix = format!("{}/", kind.tag());
        let guard = self.data.pin();
        guard.iter().filter(|(key, _)| key.starts_with(&prefix)).count()
    }

    /// Returns the id of the open transaction this storage tracks for `ctx`.
    fn transaction_id(&self, ctx: &Context) -> StorageResult<Option<Uuid>> {
        let Some(handle) = ctx.transaction() else {
            return Ok(None);
        };
        if handle.owner() != BACKEND_NAME {
            return Ok(None);
        }
        if !handle.is_open() {
            return Err(StorageError::transaction_error(format!(
                "transaction {} is already finished",
                handle.id()
            )));
        }
        if !self.transactions.lock().contains_key(&handle.id()) {
            return Err(StorageError::transaction_error(format!(
                "unknown transaction {}",
                handle.id()
            )));
        }
        Ok(Some(handle.id()))
    }

    fn committed(&self, kind: EntityKind, id: &str) -> Option<Record> {
        let guard = self.data.pin();
        guard.get(&make_storage_key(kind, id)).cloned()
    }

    fn committed_snapshot(&self, kind: EntityKind) -> BTreeMap<String, Record> {
        let prefix = format!("{}/", kind.tag());
        let guard = self.data.pin();
        guard
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, record)| (record.id.clone(), record.clone()))
            .collect()
    }

    /// Resolves one entity as seen by `tx`, or the committed value.
    fn view(&self, tx: Option<Uuid>, kind: EntityKind, id: &str) -> Option<Record> {
        let committed = self.committed(kind, id);
        match tx {
            Some(tx) => match self.transactions.lock().get(&tx) {
                Some(pending) => pending.resolve(kind, id, committed),
                None => committed,
            },
            None => committed,
        }
    }

    /// Every entity of a kind as seen by `tx`, ordered by id.
    fn view_all(&self, tx: Option<Uuid>, kind: EntityKind) -> Vec<Record> {
        let snapshot = self.committed_snapshot(kind);
        let snapshot = match tx {
            Some(tx) => match self.transactions.lock().get(&tx) {
                Some(pending) => pending.overlay(kind, snapshot),
                None => snapshot,
            },
            None => snapshot,
        };
        snapshot.into_values().collect()
    }

    fn entities<T: Entity>(&self, ctx: &Context) -> StorageResult<Vec<T>> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;
        self.view_all(tx, T::KIND)
            .iter()
            .map(|record| Ok(record.decode::<T>()?))
            .collect()
    }

    fn find_entity_where<T: Entity>(
        &self,
        ctx: &Context,
        predicate: impl Fn(&T) -> bool,
    ) -> StorageResult<Option<T>> {
        Ok(self.entities::<T>(ctx)?.into_iter().find(|e| predicate(e)))
    }

    fn stream_entities_where<T: Entity>(
        &self,
        ctx: &Context,
        predicate: impl Fn(&T) -> bool,
    ) -> StorageResult<EntityStream<T>> {
        let items: Vec<T> = self
            .entities::<T>(ctx)?
            .into_iter()
            .filter(|e| predicate(e))
            .collect();
        Ok(stream_of(items))
    }

    /// Stages `op` inside the transaction, or applies it and returns the
    /// event to publish.
    fn write(&self, tx: Option<Uuid>, op: TxOp, event: ChangeEvent) -> StorageResult<Option<ChangeEvent>> {
        match tx {
            Some(tx) => {
                let mut transactions = self.transactions.lock();
                let pending = transactions.get_mut(&tx).ok_or_else(|| {
                    StorageError::transaction_error(format!("unknown transaction {tx}"))
                })?;
                pending.stage(op, event);
                Ok(None)
            }
            None => {
                let _write = self.write_lock.lock();
                self.validate_ops(std::slice::from_ref(&op))?;
                self.apply(op);
                Ok(Some(event))
            }
        }
    }

    /// Checks staged operations against the committed data, in order.
    fn validate_ops(&self, ops: &[TxOp]) -> StorageResult<()> {
        let mut overlay: HashMap<StorageKey, bool> = HashMap::new();
        let mut cleared: Vec<EntityKind> = Vec::new();
        let guard = self.data.pin();
        let exists = |overlay: &HashMap<StorageKey, bool>, cleared: &[EntityKind], kind, key: &StorageKey| {
            match overlay.get(key) {
                Some(present) => *present,
                None => !cleared.contains(&kind) && guard.contains_key(key),
            }
        };

        for op in ops {
            match op {
                TxOp::Create(record) => {
                    let key = make_storage_key(record.kind, &record.id);
                    if exists(&overlay, &cleared, record.kind, &key) {
                        return Err(StorageError::already_exists(record.kind, &record.id));
                    }
                    overlay.insert(key, true);
                }
                TxOp::Update(record) => {
                    let key = make_storage_key(record.kind, &record.id);
                    if !exists(&overlay, &cleared, record.kind, &key) {
                        return Err(StorageError::not_found(record.kind, &record.id));
                    }
                }
                TxOp::Delete { kind, id } => {
                    let key = make_storage_key(*kind, id);
                    if !exists(&overlay, &cleared, *kind, &key) {
                        return Err(StorageError::not_found(*kind, id));
                    }
                    overlay.insert(key, false);
                }
                TxOp::DeleteAll(kind) => {
                    let prefix = format!("{}/", kind.tag());
                    overlay.retain(|key, _| !key.starts_with(&prefix));
                    cleared.push(*kind);
                }
            }
        }
        Ok(())
    }

    fn apply(&self, op: TxOp) {
        let guard = self.data.pin();
        match op {
            TxOp::Create(record) | TxOp::Update(record) => {
                guard.insert(make_storage_key(record.kind, &record.id), record);
            }
            TxOp::Delete { kind, id } => {
                guard.remove(&make_storage_key(kind, &id));
            }
            TxOp::DeleteAll(kind) => {
                let prefix = format!("{}/", kind.tag());
                let keys: Vec<StorageKey> = guard
                    .iter()
                    .filter(|(key, _)| key.starts_with(&prefix))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in keys {
                    guard.remove(&key);
                }
            }
        }
    }

    async fn publish(&self, event: Option<ChangeEvent>) {
        if let Some(event) = event {
            self.events.publish(event).await;
        }
    }
}

fn validate_record(record: &Record) -> StorageResult<()> {
    if record.kind == EntityKind::ReleaseRollout {
        record.decode::<ReleaseRollout>()?.plan.validate()?;
    }
    Ok(())
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;
        record.ensure_id();
        validate_record(record)?;

        if tx.is_some() && self.view(tx, record.kind, &record.id).is_some() {
            return Err(StorageError::already_exists(record.kind, &record.id));
        }

        let event = self.write(
            tx,
            TxOp::Create(record.clone()),
            ChangeEvent::created(record.clone()),
        )?;
        debug!(kind = %record.kind, id = %record.id, staged = tx.is_some(), "created entity");
        self.publish(event).await;
        Ok(())
    }

    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;
        Ok(self.view(tx, kind, id))
    }

    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;
        Ok(stream_of(self.view_all(tx, kind)))
    }

    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;
        if !record.has_id() {
            return Err(StorageError::invalid_entity(format!(
                "{} update requires an id",
                record.kind
            )));
        }
        validate_record(record)?;

        if tx.is_some() && self.view(tx, record.kind, &record.id).is_none() {
            return Err(StorageError::not_found(record.kind, &record.id));
        }

        let event = self.write(
            tx,
            TxOp::Update(record.clone()),
            ChangeEvent::updated(record.clone()),
        )?;
        debug!(kind = %record.kind, id = %record.id, staged = tx.is_some(), "updated entity");
        self.publish(event).await;
        Ok(())
    }

    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;

        if tx.is_some() && self.view(tx, kind, id).is_none() {
            return Err(StorageError::not_found(kind, id));
        }

        let event = self.write(
            tx,
            TxOp::Delete {
                kind,
                id: id.to_string(),
            },
            ChangeEvent::deleted(kind, id),
        )?;
        debug!(kind = %kind, id = %id, staged = tx.is_some(), "deleted entity");
        self.publish(event).await;
        Ok(())
    }

    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        ctx.check()?;
        let tx = self.transaction_id(ctx)?;
        let event = self.write(tx, TxOp::DeleteAll(kind), ChangeEvent::deleted_all(kind))?;
        debug!(kind = %kind, staged = tx.is_some(), "deleted all entities");
        self.publish(event).await;
        Ok(())
    }

    async fn find_release_flag_by_name(
        &self,
        ctx: &Context,
        name: &str,
    ) -> StorageResult<Option<ReleaseFlag>> {
        self.find_entity_where(ctx, |flag: &ReleaseFlag| flag.name == name)
    }

    async fn find_release_flags_by_names(
        &self,
        ctx: &Context,
        names: &[String],
    ) -> StorageResult<EntityStream<ReleaseFlag>> {
        self.stream_entities_where(ctx, |flag: &ReleaseFlag| names.contains(&flag.name))
    }

    async fn find_release_rollout_by_flag_and_environment(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
    ) -> StorageResult<Option<ReleaseRollout>> {
        self.find_entity_where(ctx, |rollout: &ReleaseRollout| {
            rollout.flag_id == flag_id && rollout.deployment_environment_id == environment_id
        })
    }

    async fn find_release_pilot_by_external_id(
        &self,
        ctx: &Context,
        flag_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> StorageResult<Option<ReleasePilot>> {
        self.find_entity_where(ctx, |pilot: &ReleasePilot| {
            pilot.flag_id == flag_id
                && pilot.deployment_environment_id == environment_id
                && pilot.external_id == external_id
        })
    }

    async fn find_release_pilots_by_release_flag(
        &self,
        ctx: &Context,
        flag_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        self.stream_entities_where(ctx, |pilot: &ReleasePilot| pilot.flag_id == flag_id)
    }

    async fn find_release_pilots_by_external_id(
        &self,
        ctx: &Context,
        external_id: &str,
    ) -> StorageResult<EntityStream<ReleasePilot>> {
        self.stream_entities_where(ctx, |pilot: &ReleasePilot| pilot.external_id == external_id)
    }

    async fn find_token_by_hash(
        &self,
        ctx: &Context,
        sha512: &str,
    ) -> StorageResult<Option<Token>> {
        self.find_entity_where(ctx, |token: &Token| token.sha512 == sha512)
    }

    async fn find_deployment_environment_by_alias(
        &self,
        ctx: &Context,
        alias: &str,
    ) -> StorageResult<Option<DeploymentEnvironment>> {
        self.find_entity_where(ctx, |env: &DeploymentEnvironment| env.matches_alias(alias))
    }

    async fn begin_tx(&self, ctx: &Context) -> StorageResult<Context> {
        ctx.check()?;
        if let Some(open) = ctx.open_transaction() {
            return Err(StorageError::transaction_error(format!(
                "transaction {} is already open on this context",
                open.id()
            )));
        }
        let handle = TransactionHandle::new(BACKEND_NAME);
        self.transactions
            .lock()
            .insert(handle.id(), PendingTransaction::default());
        debug!(tx = %handle.id(), "transaction started");
        Ok(ctx.with_transaction(handle))
    }

    async fn commit_tx(&self, ctx: &Context) -> StorageResult<()> {
        let handle = ctx
            .transaction()
            .ok_or_else(|| StorageError::transaction_error("no transaction to commit"))?;
        if !handle.finish() {
            return Err(StorageError::transaction_error(format!(
                "transaction {} is already finished",
                handle.id()
            )));
        }
        let pending = self
            .transactions
            .lock()
            .remove(&handle.id())
            .ok_or_else(|| {
                StorageError::transaction_error(format!("unknown transaction {}", handle.id()))
            })?;

        {
            let _write = self.write_lock.lock();
            self.validate_ops(&pending.ops)?;
            for op in pending.ops {
                self.apply(op);
            }
        }

        let event_count = pending.events.len();
        self.events.publish_all(pending.events).await;
        debug!(tx = %handle.id(), events = event_count, "transaction committed");
        Ok(())
    }

    async fn rollback_tx(&self, ctx: &Context) -> StorageResult<()> {
        let handle = ctx
            .transaction()
            .ok_or_else(|| StorageError::transaction_error("no transaction to roll back"))?;
        if !handle.finish() {
            return Err(StorageError::transaction_error(format!(
                "transaction {} is already finished",
                handle.id()
            )));
        }
        let discarded = self
            .transactions
            .lock()
            .remove(&handle.id())
            .map(|pending| pending.ops.len())
            .unwrap_or_default();
        debug!(tx = %handle.id(), discarded, "transaction rolled back");
        Ok(())
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        kind: EntityKind,
        mutation: Mutation,
        subscriber: Arc<dyn Subscriber>,
    ) -> StorageResult<Subscription> {
        ctx.check()?;
        Ok(self.events.subscribe(kind, mutation, subscriber))
    }

    async fn close(&self) -> StorageResult<()> {
        let open = {
            let mut transactions = self.transactions.lock();
            let open = transactions.len();
            transactions.clear();
            open
        };
        debug!(open_transactions = open, "in-memory storage closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }
}
