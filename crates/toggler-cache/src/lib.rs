//! Cache layer for Toggler storages.
//!
//! [`CacheManager`] implements the `Storage` contract in front of a source
//! storage. Point lookups and every domain finder are served cache-aside
//! from a [`CacheStorage`] backend; the source's change events drive
//! invalidation. Reads inside a transaction always go to the source.
//!
//! Backends:
//! - [`MemoryCacheStorage`]: in-process `DashMap`
//! - [`RedisCacheStorage`]: Redis through a deadpool connection pool
//!
//! [`create_cached_storage`] picks one from a [`CacheConfig`] and falls back
//! to the pass-through [`NullCache`] when none applies.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use toggler_cache::create_cached_storage;
//! use toggler_db_memory::InMemoryStorage;
//! use toggler_storage::Context;
//!
//! let config = toggler_cache::load_config(None)?;
//! toggler_cache::observability::init_tracing(&config.logging)?;
//!
//! let ctx = Context::background();
//! let source = Arc::new(InMemoryStorage::new());
//! let storage = create_cached_storage(&ctx, source, &config).await?;
//! let flag = storage.find_release_flag_by_name(&ctx, "checkout-v2").await?;
//! ```

pub mod config;
pub mod factory;
mod invalidation;
pub mod manager;
pub mod memory;
pub mod null;
pub mod observability;
pub mod query;
pub mod redis_cache;
pub mod storage;

pub use config::{CacheConfig, LoggingConfig, RedisSettings, load_config};
pub use factory::{create_cached_storage, create_cached_storage_from_url};
pub use manager::CacheManager;
pub use memory::MemoryCacheStorage;
pub use null::NullCache;
pub use query::{CachedQuery, QueryId, cache_registry};
pub use redis_cache::RedisCacheStorage;
pub use storage::{CacheStorage, CacheStorageExt};
