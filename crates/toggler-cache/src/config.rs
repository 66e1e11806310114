//! Cache configuration.
//!
//! Loaded from an optional TOML file plus `TOGGLER__`-prefixed environment
//! overrides, e.g. `TOGGLER__REDIS__POOL_SIZE=20`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::observability::parse_level;

/// URL token selecting the in-process cache backend.
pub const MEMORY_URL: &str = "memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// `memory`, a `redis://` / `rediss://` URL, or anything else for no cache.
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub redis: RedisSettings,

    /// Optional expiry for cached entries, in seconds.
    #[serde(default)]
    pub entry_ttl_secs: Option<u64>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_url() -> String {
    MEMORY_URL.to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            redis: RedisSettings::default(),
            entry_ttl_secs: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Config selecting the backend named by `url`, defaults elsewhere.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_secs.map(Duration::from_secs)
    }

    pub fn is_redis(&self) -> bool {
        self.url.starts_with("redis://") || self.url.starts_with("rediss://")
    }

    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_URL
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.is_redis() {
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        if self.entry_ttl_secs == Some(0) {
            return Err("entry_ttl_secs must be > 0 when set".into());
        }
        parse_level(&self.logging.level)?;
        Ok(())
    }
}

/// Redis connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Wait, create and recycle timeout in milliseconds.
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub fn load_config(path: Option<&str>) -> Result<CacheConfig, String> {
    let mut builder = Config::builder();
    let file = PathBuf::from(path.unwrap_or("toggler.toml"));
    if file.exists() {
        builder = builder.add_source(File::from(file));
    }
    // Environment variable overrides, e.g., TOGGLER__URL=redis://localhost:6379
    builder = builder.add_source(
        Environment::with_prefix("TOGGLER")
            .try_parsing(true)
            .separator("__"),
    );
    let cfg = builder
        .build()
        .map_err(|e| format!("config build error: {e}"))?;
    let merged: CacheConfig = cfg
        .try_deserialize()
        .map_err(|e| format!("config deserialize error: {e}"))?;
    merged.validate()?;
    Ok(merged)
}
