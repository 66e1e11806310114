//! Change events and their delivery to subscribers.
//!
//! Storages publish a [`ChangeEvent`] after every successful mutation. The
//! [`EventBus`] routes each event to the subscribers registered for its
//! entity kind and mutation.
//!
//! Two delivery modes exist:
//!
//! - [`DeliveryMode::Synchronous`]: the publishing write awaits every matching
//!   handler. When the write returns, its handlers have completed.
//! - [`DeliveryMode::Background`]: events travel over a `tokio::sync::broadcast`
//!   channel and each subscription drains it from its own task. A handler runs
//!   once the runtime schedules that task.
//!
//! Handlers always receive a detached [`Context`] so a writer abandoning its
//! request can never abort them.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toggler_core::{EntityKind, Record};
use tracing::{debug, error, warn};

use crate::StorageResult;
use crate::context::Context;
use crate::error::StorageError;

/// Default buffer size for background delivery.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// The kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Create,
    Update,
    DeleteById,
    DeleteAll,
}

impl Mutation {
    pub const ALL: [Mutation; 4] = [
        Mutation::Create,
        Mutation::Update,
        Mutation::DeleteById,
        Mutation::DeleteAll,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Mutation::Create => "create",
            Mutation::Update => "update",
            Mutation::DeleteById => "delete_by_id",
            Mutation::DeleteAll => "delete_all",
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed change to one entity kind.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub mutation: Mutation,
    /// Id of the affected entity. `None` for `DeleteAll`.
    pub id: Option<String>,
    /// New value of the entity for `Create` and `Update`.
    pub record: Option<Record>,
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn created(record: Record) -> Self {
        Self::with_record(Mutation::Create, record)
    }

    pub fn updated(record: Record) -> Self {
        Self::with_record(Mutation::Update, record)
    }

    pub fn deleted(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            mutation: Mutation::DeleteById,
            id: Some(id.into()),
            record: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn deleted_all(kind: EntityKind) -> Self {
        Self {
            kind,
            mutation: Mutation::DeleteAll,
            id: None,
            record: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn with_record(mutation: Mutation, record: Record) -> Self {
        Self {
            kind: record.kind,
            mutation,
            id: Some(record.id.clone()),
            record: Some(record),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Receiver of change events for one entity kind and mutation.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "subscriber"
    }

    /// Handles one event.
    async fn handle(&self, ctx: &Context, event: &ChangeEvent) -> StorageResult<()>;

    /// Called when an event could not be handled or was never delivered.
    /// `kind` and `mutation` identify the subscription.
    async fn error(
        &self,
        ctx: &Context,
        kind: EntityKind,
        mutation: Mutation,
        err: StorageError,
    ) -> StorageResult<()>;
}

/// How the bus hands events to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Synchronous,
    Background {
        buffer: usize,
    },
}

impl DeliveryMode {
    pub fn background() -> Self {
        DeliveryMode::Background {
            buffer: DEFAULT_BUFFER_SIZE,
        }
    }
}

struct Registration {
    id: u64,
    kind: EntityKind,
    mutation: Mutation,
    subscriber: Arc<dyn Subscriber>,
}

struct BusInner {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    sender: Option<broadcast::Sender<ChangeEvent>>,
}

impl BusInner {
    fn unregister(&self, id: u64) {
        self.registrations.lock().retain(|reg| reg.id != id);
    }
}

/// Routes change events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    mode: DeliveryMode,
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(mode: DeliveryMode) -> Self {
        let sender = match mode {
            DeliveryMode::Synchronous => None,
            DeliveryMode::Background { buffer } => Some(broadcast::channel(buffer.max(1)).0),
        };
        Self {
            mode,
            inner: Arc::new(BusInner {
                registrations: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registrations.lock().len()
    }

    /// Registers a subscriber for one kind and mutation.
    ///
    /// In background mode this spawns the subscription's delivery task, so it
    /// must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        kind: EntityKind,
        mutation: Mutation,
        subscriber: Arc<dyn Subscriber>,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registrations.lock().push(Registration {
            id,
            kind,
            mutation,
            subscriber: subscriber.clone(),
        });

        let task = self.inner.sender.as_ref().map(|sender| {
            let receiver = sender.subscribe();
            let token = CancellationToken::new();
            let handle = tokio::spawn(run_subscription(
                receiver,
                token.clone(),
                kind,
                mutation,
                subscriber,
            ));
            (token, handle)
        });

        debug!(kind = %kind, mutation = %mutation, subscription = id, "subscribed");

        Subscription {
            id,
            kind,
            mutation,
            bus: Some(Arc::downgrade(&self.inner)),
            task,
        }
    }

    /// Publishes an event.
    ///
    /// In synchronous mode this returns once every matching handler has run.
    /// Handler failures are reported to the subscriber, never to the caller.
    pub async fn publish(&self, event: ChangeEvent) {
        match &self.inner.sender {
            None => {
                let subscribers: Vec<Arc<dyn Subscriber>> = self
                    .inner
                    .registrations
                    .lock()
                    .iter()
                    .filter(|reg| reg.kind == event.kind && reg.mutation == event.mutation)
                    .map(|reg| reg.subscriber.clone())
                    .collect();
                for subscriber in subscribers {
                    deliver(subscriber.as_ref(), &event).await;
                }
            }
            Some(sender) => {
                let receivers = sender.send(event).unwrap_or_default();
                debug!(receivers, "queued change event");
            }
        }
    }

    /// Publishes events in order.
    pub async fn publish_all(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DeliveryMode::default())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("mode", &self.mode)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

async fn run_subscription(
    mut receiver: broadcast::Receiver<ChangeEvent>,
    token: CancellationToken,
    kind: EntityKind,
    mutation: Mutation,
    subscriber: Arc<dyn Subscriber>,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(event) => {
                    if event.kind == kind && event.mutation == mutation {
                        deliver(subscriber.as_ref(), &event).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        subscriber = subscriber.name(),
                        kind = %kind,
                        mutation = %mutation,
                        skipped,
                        "subscriber lagged, missed events"
                    );
                    report(subscriber.as_ref(), kind, mutation, StorageError::Lagged { skipped })
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(subscriber = subscriber.name(), kind = %kind, mutation = %mutation, "subscription task stopped");
}

async fn deliver(subscriber: &dyn Subscriber, event: &ChangeEvent) {
    let ctx = Context::detached();
    let outcome = AssertUnwindSafe(subscriber.handle(&ctx, event))
        .catch_unwind()
        .await;
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            StorageError::internal(format!("subscriber panicked: {message}"))
        }
    };
    warn!(
        subscriber = subscriber.name(),
        kind = %event.kind,
        mutation = %event.mutation,
        error = %err,
        "change event handler failed"
    );
    report(subscriber, event.kind, event.mutation, err).await;
}

async fn report(subscriber: &dyn Subscriber, kind: EntityKind, mutation: Mutation, err: StorageError) {
    let ctx = Context::detached();
    let outcome = AssertUnwindSafe(subscriber.error(&ctx, kind, mutation, err))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(
            subscriber = subscriber.name(),
            kind = %kind,
            mutation = %mutation,
            error = %err,
            "subscriber error callback failed"
        ),
        Err(_) => error!(
            subscriber = subscriber.name(),
            kind = %kind,
            mutation = %mutation,
            "subscriber error callback panicked"
        ),
    }
}

/// A live registration. Dropping it unregisters without waiting; `close`
/// also waits for a background delivery task to finish.
pub struct Subscription {
    id: u64,
    kind: EntityKind,
    mutation: Mutation,
    bus: Option<Weak<BusInner>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Subscription {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn mutation(&self) -> Mutation {
        self.mutation
    }

    /// Unregisters the subscriber and stops its delivery task.
    pub async fn close(mut self) {
        self.detach();
        if let Some((_, handle)) = self.task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "subscription task ended abnormally");
            }
        }
        debug!(kind = %self.kind, mutation = %self.mutation, subscription = self.id, "subscription closed");
    }

    fn detach(&mut self) {
        if let Some(bus) = self.bus.take().and_then(|bus| bus.upgrade()) {
            bus.unregister(self.id);
        }
        if let Some((token, _)) = &self.task {
            token.cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("mutation", &self.mutation)
            .field("background", &self.task.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        handled: AtomicUsize,
        errors: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn handle(&self, _ctx: &Context, _event: &ChangeEvent) -> StorageResult<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StorageError::internal("handler failed"));
            }
            Ok(())
        }

        async fn error(
            &self,
            _ctx: &Context,
            _kind: EntityKind,
            _mutation: Mutation,
            err: StorageError,
        ) -> StorageResult<()> {
            self.errors.lock().push(err.to_string());
            Ok(())
        }
    }

    fn flag_record(id: &str) -> Record {
        Record::new(EntityKind::ReleaseFlag, json!({"id": id, "name": "checkout"})).unwrap()
    }

    #[tokio::test]
    async fn test_synchronous_delivery_filters_by_kind_and_mutation() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        let _sub = bus.subscribe(EntityKind::ReleaseFlag, Mutation::Update, recorder.clone());

        bus.publish(ChangeEvent::created(flag_record("1"))).await;
        bus.publish(ChangeEvent::deleted(EntityKind::Token, "1")).await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 0);

        bus.publish(ChangeEvent::updated(flag_record("1"))).await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported_to_subscriber() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let _sub = bus.subscribe(EntityKind::ReleaseFlag, Mutation::DeleteAll, recorder.clone());

        bus.publish(ChangeEvent::deleted_all(EntityKind::ReleaseFlag))
            .await;
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_receiving() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        let sub = bus.subscribe(EntityKind::ReleaseFlag, Mutation::Create, recorder.clone());
        assert_eq!(bus.subscriber_count(), 1);

        sub.close().await;
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(ChangeEvent::created(flag_record("1"))).await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        drop(bus.subscribe(EntityKind::ReleaseFlag, Mutation::Create, recorder));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_background_delivery() {
        let bus = EventBus::new(DeliveryMode::background());
        let recorder = Arc::new(Recorder::default());
        let sub = bus.subscribe(EntityKind::ReleaseFlag, Mutation::Create, recorder.clone());

        bus.publish(ChangeEvent::created(flag_record("1"))).await;
        bus.publish(ChangeEvent::updated(flag_record("1"))).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.handled.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("background handler should run");

        sub.close().await;
        assert_eq!(recorder.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_lag_is_reported() {
        let bus = EventBus::new(DeliveryMode::Background { buffer: 1 });
        let recorder = Arc::new(Recorder::default());
        let sub = bus.subscribe(EntityKind::ReleaseFlag, Mutation::Create, recorder.clone());

        // The current-thread runtime does not run the subscription task
        // until this task yields, so the buffer overflows.
        for i in 0..4 {
            bus.publish(ChangeEvent::created(flag_record(&i.to_string())))
                .await;
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.errors.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lag should be reported");

        assert!(recorder.errors.lock()[0].contains("lagged"));
        sub.close().await;
    }

    #[test]
    fn test_mutation_names() {
        let names: Vec<&str> = Mutation::ALL.iter().map(Mutation::as_str).collect();
        assert_eq!(names, ["create", "update", "delete_by_id", "delete_all"]);
        assert_eq!(
            serde_json::to_string(&Mutation::DeleteById).unwrap(),
            "\"delete_by_id\""
        );
    }
}
