//! In-process cache backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toggler_core::{EntityKind, Record};
use toggler_storage::{Context, RecordStream, StorageError, StorageResult, stream_of};
use tracing::debug;

use crate::storage::CacheStorage;

const BACKEND_NAME: &str = "memory";
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A cached value with the instant it was stored.
#[derive(Clone, Debug)]
struct CachedEntry {
    record: Record,
    cached_at: Instant,
}

impl CachedEntry {
    fn new(record: Record) -> Self {
        Self {
            record,
            cached_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.cached_at.elapsed() > ttl)
    }
}

fn cache_key(kind: EntityKind, id: &str) -> String {
    format!("{}#{id}", kind.tag())
}

fn cache_prefix(kind: EntityKind) -> String {
    format!("{}#", kind.tag())
}

/// Cache backend over a `DashMap`.
///
/// Without a TTL, entries live until deleted. With a TTL, expired entries
/// read as misses and a sweep task owned by the backend removes them. The
/// sweep task stops on [`close`](CacheStorage::close).
pub struct MemoryCacheStorage {
    entries: Arc<DashMap<String, CachedEntry>>,
    ttl: Option<Duration>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStorage {
    /// Creates a backend whose entries never expire.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl: None,
            sweeper: Mutex::new(None),
        }
    }

    /// Creates a backend whose entries expire after `ttl` and starts its
    /// sweep task. Must be called within a tokio runtime.
    pub fn with_ttl(ttl: Duration) -> Self {
        let entries = Arc::new(DashMap::new());
        let token = CancellationToken::new();
        let handle = tokio::spawn(sweep(entries.clone(), ttl, token.clone()));
        Self {
            entries,
            ttl: Some(ttl),
            sweeper: Mutex::new(Some((token, handle))),
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str) -> Option<Record> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.record.clone())
    }
}

async fn sweep(entries: Arc<DashMap<String, CachedEntry>>, ttl: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval((ttl / 2).max(MIN_SWEEP_INTERVAL));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired(Some(ttl)));
                let removed = before.saturating_sub(entries.len());
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        }
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()> {
        ctx.check()?;
        record.ensure_id();
        match self.entries.entry(cache_key(record.kind, &record.id)) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(self.ttl) {
                    return Err(StorageError::already_exists(record.kind, &record.id));
                }
                occupied.insert(CachedEntry::new(record.clone()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedEntry::new(record.clone()));
            }
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        ctx.check()?;
        Ok(self.live(&cache_key(kind, id)))
    }

    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream> {
        ctx.check()?;
        let prefix = cache_prefix(kind);
        let mut records: Vec<Record> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix) && !entry.is_expired(self.ttl))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stream_of(records))
    }

    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()> {
        ctx.check()?;
        match self.entries.get_mut(&cache_key(record.kind, &record.id)) {
            Some(mut entry) if !entry.is_expired(self.ttl) => {
                *entry = CachedEntry::new(record.clone());
                Ok(())
            }
            _ => Err(StorageError::not_found(record.kind, &record.id)),
        }
    }

    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()> {
        ctx.check()?;
        match self.entries.remove(&cache_key(kind, id)) {
            Some((_, entry)) if !entry.is_expired(self.ttl) => Ok(()),
            _ => Err(StorageError::not_found(kind, id)),
        }
    }

    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        ctx.check()?;
        let prefix = cache_prefix(kind);
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn upsert_many(&self, ctx: &Context, records: &mut [Record]) -> StorageResult<()> {
        ctx.check()?;
        for record in records.iter_mut() {
            record.ensure_id();
            self.entries.insert(
                cache_key(record.kind, &record.id),
                CachedEntry::new(record.clone()),
            );
        }
        Ok(())
    }

    async fn find_by_ids(
        &self,
        ctx: &Context,
        kind: EntityKind,
        ids: &[String],
    ) -> StorageResult<RecordStream> {
        ctx.check()?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.live(&cache_key(kind, id)) {
                Some(record) => results.push(Ok(record)),
                None => {
                    results.push(Err(StorageError::not_found(kind, id.as_str())));
                    break;
                }
            }
        }
        Ok(Box::pin(futures_util::stream::iter(results)))
    }

    async fn close(&self) -> StorageResult<()> {
        let sweeper = self.sweeper.lock().take();
        if let Some((token, handle)) = sweeper {
            token.cancel();
            if let Err(err) = handle.await {
                return Err(StorageError::internal(format!(
                    "cache sweep task failed: {err}"
                )));
            }
        }
        self.entries.clear();
        debug!("memory cache closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }
}

impl Drop for MemoryCacheStorage {
    fn drop(&mut self) {
        if let Some((token, _)) = self.sweeper.get_mut().as_ref() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use serde_json::json;

    fn flag(id: &str, name: &str) -> Record {
        Record::new(EntityKind::ReleaseFlag, json!({"id": id, "name": name})).unwrap()
    }

    fn ctx() -> Context {
        Context::background()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let cache = MemoryCacheStorage::new();
        let mut record = flag("1", "a");
        cache.create(&ctx(), &mut record).await.unwrap();

        let found = cache
            .find_by_id(&ctx(), EntityKind::ReleaseFlag, "1")
            .await
            .unwrap();
        assert_eq!(found, Some(record.clone()));
        assert!(
            cache
                .create(&ctx(), &mut record)
                .await
                .unwrap_err()
                .is_already_exists()
        );
        assert!(
            cache
                .find_by_id(&ctx(), EntityKind::Token, "1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let cache = MemoryCacheStorage::new();
        let mut record = Record::new(EntityKind::ReleaseFlag, json!({"name": "a"})).unwrap();
        cache.create(&ctx(), &mut record).await.unwrap();
        assert!(record.has_id());
        assert_eq!(record.body["id"], record.id.as_str());
    }

    #[tokio::test]
    async fn test_point_operations_on_missing_ids() {
        let cache = MemoryCacheStorage::new();
        assert!(cache.update(&ctx(), &flag("1", "a")).await.unwrap_err().is_not_found());
        assert!(
            cache
                .delete_by_id(&ctx(), EntityKind::ReleaseFlag, "1")
                .await
                .unwrap_err()
                .is_not_found()
        );
        cache.delete_all(&ctx(), EntityKind::ReleaseFlag).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_by_ids_preserves_order_and_fails_on_missing() {
        let cache = MemoryCacheStorage::new();
        let mut records = vec![flag("1", "a"), flag("2", "b"), flag("3", "c")];
        cache.upsert_many(&ctx(), &mut records).await.unwrap();

        let ids = vec!["3".to_string(), "1".to_string()];
        let found: Vec<Record> = cache
            .find_by_ids(&ctx(), EntityKind::ReleaseFlag, &ids)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found, vec![records[2].clone(), records[0].clone()]);

        let ids = vec!["1".to_string(), "missing".to_string()];
        let result: StorageResult<Vec<Record>> = cache
            .find_by_ids(&ctx(), EntityKind::ReleaseFlag, &ids)
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_all_is_scoped_to_kind() {
        let cache = MemoryCacheStorage::new();
        let mut records = vec![
            flag("1", "a"),
            Record::new(EntityKind::Token, json!({"id": "1"})).unwrap(),
        ];
        cache.upsert_many(&ctx(), &mut records).await.unwrap();

        cache.delete_all(&ctx(), EntityKind::ReleaseFlag).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(
            cache
                .find_by_id(&ctx(), EntityKind::Token, "1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let cache = MemoryCacheStorage::new();
        cache.upsert_many(&ctx(), &mut [flag("1", "a")]).await.unwrap();
        cache.upsert_many(&ctx(), &mut [flag("1", "b")]).await.unwrap();
        let found = cache
            .find_by_id(&ctx(), EntityKind::ReleaseFlag, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body["name"], "b");
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses_and_swept() {
        let cache = MemoryCacheStorage::with_ttl(Duration::from_millis(50));
        cache.upsert_many(&ctx(), &mut [flag("1", "a")]).await.unwrap();
        assert!(
            cache
                .find_by_id(&ctx(), EntityKind::ReleaseFlag, "1")
                .await
                .unwrap()
                .is_some()
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(
            cache
                .find_by_id(&ctx(), EntityKind::ReleaseFlag, "1")
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep should remove expired entries");

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_sweeper() {
        let cache = MemoryCacheStorage::with_ttl(Duration::from_secs(60));
        cache.close().await.unwrap();
        assert!(cache.sweeper.lock().is_none());
        // A second close is a no-op.
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let cache = MemoryCacheStorage::new();
        let ctx = ctx();
        ctx.cancel();
        assert!(matches!(
            cache.find_by_id(&ctx, EntityKind::ReleaseFlag, "1").await,
            Err(StorageError::Cancelled)
        ));
    }
}
