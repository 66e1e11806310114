//! Request-scoped context.
//!
//! Every storage and cache call takes a [`Context`]. It carries the caller's
//! cancellation signal and deadline, the source storage's transaction handle
//! (if a transaction is open) and the cache's transaction marker.
//!
//! Contexts are cheap to clone. Clones share cancellation, the transaction
//! handle and the marker, so committing through one clone is visible to all.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StorageError;
use crate::StorageResult;

/// Identity and state of a transaction opened by a source storage.
#[derive(Debug)]
pub struct TransactionHandle {
    id: Uuid,
    owner: &'static str,
    open: AtomicBool,
}

impl TransactionHandle {
    /// Creates an open transaction owned by the named backend.
    pub fn new(owner: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            owner,
            open: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the backend that opened the transaction.
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the transaction finished. Returns `false` if it was already
    /// finished, so commit and rollback can each happen at most once.
    pub fn finish(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

/// Marker recording that a call runs inside a transaction opened through a
/// cache. The cache consults it on every read.
#[derive(Debug, Clone)]
struct TransactionMarker(Arc<AtomicBool>);

/// Request-scoped context.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    transaction: Option<Arc<TransactionHandle>>,
    marker: Option<TransactionMarker>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A fresh context with no deadline, no transaction and its own
    /// cancellation token.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            transaction: None,
            marker: None,
        }
    }

    /// A fresh context bound to an existing cancellation token.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..Self::background()
        }
    }

    /// A context for work that must outlive the request that triggered it,
    /// such as cache invalidation after a write. It is never cancelled by the
    /// original caller and carries no transaction state.
    pub fn detached() -> Self {
        Self::background()
    }

    /// Derives a child context. Cancelling the parent cancels the child, but
    /// not the other way round.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            ..self.child()
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Fails if the context is cancelled or past its deadline.
    pub fn check(&self) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Runs `fut` until it completes, the context is cancelled, or the
    /// deadline passes, whichever comes first. An aborted future is dropped.
    pub async fn run<F, T>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            _ = sleep_until(deadline) => Err(StorageError::DeadlineExceeded),
            result = fut => result,
        }
    }

    /// The source transaction handle attached to this context, if any.
    pub fn transaction(&self) -> Option<&Arc<TransactionHandle>> {
        self.transaction.as_ref()
    }

    /// The source transaction handle, if it is still open.
    pub fn open_transaction(&self) -> Option<&Arc<TransactionHandle>> {
        self.transaction.as_ref().filter(|tx| tx.is_open())
    }

    /// Derives a context bound to a source transaction.
    pub fn with_transaction(&self, handle: Arc<TransactionHandle>) -> Self {
        Self {
            transaction: Some(handle),
            ..self.clone()
        }
    }

    /// Derives a context carrying a set transaction marker.
    pub fn mark_in_transaction(&self) -> Self {
        Self {
            marker: Some(TransactionMarker(Arc::new(AtomicBool::new(true)))),
            ..self.clone()
        }
    }

    /// Returns `true` while the transaction marker is set.
    pub fn is_in_transaction(&self) -> bool {
        self.marker
            .as_ref()
            .is_some_and(|marker| marker.0.load(Ordering::Acquire))
    }

    /// Clears the transaction marker for this context and all its clones.
    pub fn clear_transaction_marker(&self) {
        if let Some(marker) = &self.marker {
            marker.0.store(false, Ordering::Release);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_aborts_on_cancel() {
        let ctx = Context::background();
        let child = ctx.child();
        ctx.cancel();
        let result: StorageResult<()> = child.run(std::future::pending()).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_cancel_parent() {
        let ctx = Context::background();
        let child = ctx.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_aborts_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let result: StorageResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StorageError::DeadlineExceeded)));
        assert!(matches!(ctx.check(), Err(StorageError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_keeps_earlier_deadline() {
        let outer = Context::background().with_timeout(Duration::from_millis(10));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[test]
    fn test_transaction_marker_is_shared_by_clones() {
        let ctx = Context::background();
        assert!(!ctx.is_in_transaction());

        let tx_ctx = ctx.mark_in_transaction();
        let clone = tx_ctx.clone();
        assert!(clone.is_in_transaction());

        tx_ctx.clear_transaction_marker();
        assert!(!clone.is_in_transaction());
        assert!(!ctx.is_in_transaction());
    }

    #[test]
    fn test_transaction_handle_finishes_once() {
        let handle = TransactionHandle::new("test");
        let ctx = Context::background().with_transaction(handle.clone());
        assert!(ctx.open_transaction().is_some());
        assert!(handle.finish());
        assert!(!handle.finish());
        assert!(ctx.open_transaction().is_none());
        assert!(ctx.transaction().is_some());
    }

    #[test]
    fn test_detached_context_is_independent() {
        let ctx = Context::background().mark_in_transaction();
        ctx.cancel();
        let detached = Context::detached();
        assert!(!detached.is_done());
        assert!(!detached.is_in_transaction());
    }
}
