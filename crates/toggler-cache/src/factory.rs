//! Picks a cache implementation from configuration.

use std::sync::Arc;

use toggler_storage::{Context, Storage, StorageError, StorageResult};
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::manager::CacheManager;
use crate::memory::MemoryCacheStorage;
use crate::null::NullCache;
use crate::observability::apply_logging;
use crate::query::cache_registry;
use crate::redis_cache::RedisCacheStorage;
use crate::storage::CacheStorage;

/// Wraps `source` in the cache selected by `config.url`.
///
/// - `memory`: a [`CacheManager`] over [`MemoryCacheStorage`]
/// - `redis://` / `rediss://`: a [`CacheManager`] over [`RedisCacheStorage`]
/// - anything else: a [`NullCache`]
///
/// If Redis cannot be reached, the source is returned behind a
/// [`NullCache`] so the service still starts, uncached.
///
/// `config.logging` is applied to the subscriber installed by
/// [`init_tracing`](crate::observability::init_tracing), if any.
///
/// # Errors
///
/// Returns `StorageError::Configuration` if `config` does not validate.
pub async fn create_cached_storage(
    ctx: &Context,
    source: Arc<dyn Storage>,
    config: &CacheConfig,
) -> StorageResult<Arc<dyn Storage>> {
    config.validate().map_err(StorageError::configuration)?;
    apply_logging(&config.logging).map_err(StorageError::configuration)?;
    let registry = Arc::new(cache_registry());

    let cache: Arc<dyn CacheStorage> = if config.is_memory() {
        let backend = match config.entry_ttl() {
            Some(ttl) => MemoryCacheStorage::with_ttl(ttl),
            None => MemoryCacheStorage::new(),
        };
        info!(ttl = ?config.entry_ttl(), "using in-memory cache");
        Arc::new(backend)
    } else if config.is_redis() {
        match RedisCacheStorage::connect(&config.url, &config.redis, registry.clone()).await {
            Ok(backend) => {
                info!("using redis cache");
                match config.entry_ttl() {
                    Some(ttl) => Arc::new(backend.with_ttl(ttl)),
                    None => Arc::new(backend),
                }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "Failed to connect to Redis. Falling back to uncached storage."
                );
                return Ok(Arc::new(NullCache::new(source)));
            }
        }
    } else {
        info!(url = %config.url, "no cache backend configured, storage is uncached");
        return Ok(Arc::new(NullCache::new(source)));
    };

    let manager = CacheManager::new(ctx, source, cache, registry).await?;
    Ok(Arc::new(manager))
}

/// [`create_cached_storage`] with default settings for everything but the URL.
pub async fn create_cached_storage_from_url(
    ctx: &Context,
    source: Arc<dyn Storage>,
    url: &str,
) -> StorageResult<Arc<dyn Storage>> {
    create_cached_storage(ctx, source, &CacheConfig::with_url(url)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use toggler_db_memory::InMemoryStorage;

    async fn backend_for(url: &str) -> &'static str {
        let storage = create_cached_storage_from_url(
            &Context::background(),
            Arc::new(InMemoryStorage::new()),
            url,
        )
        .await
        .unwrap();
        let name = storage.backend_name();
        storage.close().await.unwrap();
        name
    }

    #[tokio::test]
    async fn test_memory_selects_manager() {
        assert_eq!(backend_for("memory").await, "cache-manager");
    }

    #[tokio::test]
    async fn test_unknown_url_selects_null_cache() {
        assert_eq!(backend_for("").await, "null-cache");
        assert_eq!(backend_for("memcached://localhost:11211").await, "null-cache");
        assert_eq!(backend_for("Memory").await, "null-cache");
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut zero_ttl = CacheConfig::default();
        zero_ttl.entry_ttl_secs = Some(0);
        let mut empty_pool = CacheConfig::with_url("redis://127.0.0.1:6379");
        empty_pool.redis.pool_size = 0;
        let mut bad_level = CacheConfig::default();
        bad_level.logging.level = "toggler_cache=loud".into();

        for config in [zero_ttl, empty_pool, bad_level] {
            let result = create_cached_storage(
                &Context::background(),
                Arc::new(InMemoryStorage::new()),
                &config,
            )
            .await;
            assert!(matches!(result, Err(StorageError::Configuration { .. })));
        }
    }

    #[tokio::test]
    async fn test_memory_with_ttl() {
        let mut config = CacheConfig::default();
        config.entry_ttl_secs = Some(30);
        let storage = create_cached_storage(
            &Context::background(),
            Arc::new(InMemoryStorage::new()),
            &config,
        )
        .await
        .unwrap();
        assert_eq!(storage.backend_name(), "cache-manager");
        storage.close().await.unwrap();
    }
}
