//! Redis cache backend.
//!
//! Values live under `"{tag}#{id}"` keys as JSON produced by the entity
//! registry codecs. Existence-sensitive writes use `SET NX` / `SET XX` so
//! each point operation is a single round trip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use futures_util::stream;
use toggler_core::{EntityKind, EntityRegistry, Record};
use toggler_storage::{Context, RecordStream, StorageError, StorageResult, stream_of};
use tracing::{debug, info};

use crate::config::RedisSettings;
use crate::storage::CacheStorage;

const BACKEND_NAME: &str = "redis";
const SCAN_BATCH: usize = 100;

fn redis_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::connection_error(format!("redis: {err}"))
}

/// `PX` argument for a TTL: at least one millisecond, saturating at `u64::MAX`.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Cache backend over a deadpool Redis pool.
pub struct RedisCacheStorage {
    pool: Pool,
    registry: Arc<EntityRegistry>,
    ttl: Option<Duration>,
}

impl RedisCacheStorage {
    /// Wraps an existing pool.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Configuration` if the registry does not cover
    /// every domain kind and `CachedQuery`.
    pub fn new(pool: Pool, registry: Arc<EntityRegistry>) -> StorageResult<Self> {
        registry.validate()?;
        Ok(Self {
            pool,
            registry,
            ttl: None,
        })
    }

    /// Sets an expiry on every value written from now on.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Builds a pool for `url` and checks that the server answers `PING`.
    pub async fn connect(
        url: &str,
        settings: &RedisSettings,
        registry: Arc<EntityRegistry>,
    ) -> StorageResult<Self> {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let mut redis_config = Config::from_url(url);
        let mut pool_config = PoolConfig::new(settings.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(redis_error)?;

        let mut conn = pool.get().await.map_err(redis_error)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        info!(pool_size = settings.pool_size, "connected to redis cache");

        Self::new(pool, registry)
    }

    fn key(&self, kind: EntityKind, id: &str) -> String {
        format!("{}#{id}", self.registry.tag(kind))
    }

    fn pattern(&self, kind: EntityKind) -> String {
        format!("{}#*", self.registry.tag(kind))
    }

    async fn connection(&self) -> StorageResult<Connection> {
        self.pool.get().await.map_err(redis_error)
    }

    fn set_cmd(&self, key: &str, payload: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if let Some(ttl) = self.ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd
    }

    async fn scan_keys(&self, conn: &mut Connection, kind: EntityKind) -> StorageResult<Vec<String>> {
        let pattern = self.pattern(kind);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(redis_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn mget(&self, conn: &mut Connection, keys: &[String]) -> StorageResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("MGET")
            .arg(keys)
            .query_async(conn)
            .await
            .map_err(redis_error)
    }
}

#[async_trait]
impl CacheStorage for RedisCacheStorage {
    async fn create(&self, ctx: &Context, record: &mut Record) -> StorageResult<()> {
        record.ensure_id();
        let key = self.key(record.kind, &record.id);
        let payload = self.registry.encode(record)?;
        ctx.run(async {
            let mut conn = self.connection().await?;
            let reply: Option<String> = self
                .set_cmd(&key, &payload)
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            match reply {
                Some(_) => Ok(()),
                None => Err(StorageError::already_exists(record.kind, record.id.as_str())),
            }
        })
        .await
    }

    async fn find_by_id(
        &self,
        ctx: &Context,
        kind: EntityKind,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        let key = self.key(kind, id);
        ctx.run(async {
            let mut conn = self.connection().await?;
            let raw: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            match raw {
                Some(raw) => Ok(Some(self.registry.decode(kind, &raw)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<RecordStream> {
        ctx.run(async {
            let mut conn = self.connection().await?;
            let keys = self.scan_keys(&mut conn, kind).await?;
            let values = self.mget(&mut conn, &keys).await?;
            // Keys expiring or deleted between SCAN and MGET come back nil.
            let mut records = values
                .into_iter()
                .flatten()
                .map(|raw| self.registry.decode(kind, &raw).map_err(StorageError::from))
                .collect::<StorageResult<Vec<Record>>>()?;
            records.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(stream_of(records))
        })
        .await
    }

    async fn update(&self, ctx: &Context, record: &Record) -> StorageResult<()> {
        let key = self.key(record.kind, &record.id);
        let payload = self.registry.encode(record)?;
        ctx.run(async {
            let mut conn = self.connection().await?;
            let reply: Option<String> = self
                .set_cmd(&key, &payload)
                .arg("XX")
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            match reply {
                Some(_) => Ok(()),
                None => Err(StorageError::not_found(record.kind, record.id.as_str())),
            }
        })
        .await
    }

    async fn delete_by_id(&self, ctx: &Context, kind: EntityKind, id: &str) -> StorageResult<()> {
        let key = self.key(kind, id);
        ctx.run(async {
            let mut conn = self.connection().await?;
            let removed: u64 = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            if removed == 0 {
                return Err(StorageError::not_found(kind, id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_all(&self, ctx: &Context, kind: EntityKind) -> StorageResult<()> {
        ctx.run(async {
            let mut conn = self.connection().await?;
            let keys = self.scan_keys(&mut conn, kind).await?;
            for chunk in keys.chunks(SCAN_BATCH) {
                let _: u64 = redis::cmd("DEL")
                    .arg(chunk)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
            }
            debug!(kind = %kind, removed = keys.len(), "redis cache kind cleared");
            Ok(())
        })
        .await
    }

    async fn upsert_many(&self, ctx: &Context, records: &mut [Record]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records.iter_mut() {
            record.ensure_id();
            let key = self.key(record.kind, &record.id);
            let payload = self.registry.encode(record)?;
            pipe.add_command(self.set_cmd(&key, &payload)).ignore();
        }
        ctx.run(async {
            let mut conn = self.connection().await?;
            let _: () = pipe.query_async(&mut conn).await.map_err(redis_error)?;
            Ok(())
        })
        .await
    }

    async fn find_by_ids(
        &self,
        ctx: &Context,
        kind: EntityKind,
        ids: &[String],
    ) -> StorageResult<RecordStream> {
        let keys: Vec<String> = ids.iter().map(|id| self.key(kind, id)).collect();
        let values = ctx
            .run(async {
                let mut conn = self.connection().await?;
                self.mget(&mut conn, &keys).await
            })
            .await?;

        let mut results = Vec::with_capacity(ids.len());
        for (id, raw) in ids.iter().zip(values) {
            match raw {
                Some(raw) => results.push(self.registry.decode(kind, &raw).map_err(StorageError::from)),
                None => {
                    results.push(Err(StorageError::not_found(kind, id.as_str())));
                    break;
                }
            }
        }
        Ok(Box::pin(stream::iter(results)))
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close();
        debug!("redis cache pool closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_bounds() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}
