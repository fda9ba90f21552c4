//! Result cache: a pure accelerator in front of expensive operations.
//!
//! Backends never surface errors. A miss and an unreachable backend look
//! the same to callers.

pub mod backoff;
pub mod key;
pub mod memory;
pub mod remote;
pub mod resp;

pub use key::CacheKey;
pub use memory::InMemoryCache;
pub use remote::{ConnectionState, RemoteCache, RemoteCacheOptions};

use crate::config::{CacheBackend, ServiceConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ResultCache: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` on a miss or when the backend is unavailable.
    async fn get(&self, key: &str) -> Option<String>;

    /// Best effort; failures are logged by the backend.
    async fn set(&self, key: &str, value: &str, expiration: Option<Duration>);

    async fn remove(&self, key: &str);

    async fn shutdown(&self);
}

/// Build the backend selected by `config.cache.backend`.
pub fn from_config(config: &ServiceConfig) -> Result<Arc<dyn ResultCache>> {
    match config.cache.backend {
        CacheBackend::Memory => Ok(Arc::new(InMemoryCache::new(config.cache.capacity))),
        CacheBackend::Remote => {
            let url = config
                .cache
                .redis_url
                .as_deref()
                .context("cache.redis_url is required for the remote backend")?;
            let options = RemoteCacheOptions {
                key_prefix: config.cache_key_prefix(),
                operation_timeout: config.cache.operation_timeout(),
                reconnect_base: Duration::from_millis(config.cache.reconnect_base_ms),
                reconnect_cap: Duration::from_millis(config.cache.reconnect_cap_ms),
            };
            Ok(Arc::new(RemoteCache::connect(url, options)?))
        }
    }
}
