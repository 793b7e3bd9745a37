//! Pooled cache client over a Redis-compatible backend.

use crate::cache::codec::{CacheCodec, Cacheable};
use crate::config::CacheSettings;
use crate::error::{StoreError, StoreResult};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

/// Shared cache store client.
///
/// Connections come from a bounded pool sized by `cache.pool.maxActive`;
/// borrows wait at most `cache.pool.maxWait` before failing with
/// [`StoreError::PoolExhausted`]. A missing key is `Ok(None)`, never an
/// error.
pub struct CacheClient {
    pool: Pool,
    max_wait_ms: u64,
    default_ttl: Option<u64>,
    key_prefix: Option<String>,
}

impl CacheClient {
    /// Build the client and its connection pool from settings.
    ///
    /// No connection is opened here; reachability surfaces on first use.
    pub fn new(settings: &CacheSettings) -> StoreResult<Self> {
        let mut config = Config::from_url(settings.connection_url());
        let mut pool_config = PoolConfig::new(settings.pool.max_active as usize);
        pool_config.timeouts.wait = Some(Duration::from_millis(settings.pool.max_wait));
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::cache(format!("Failed to create cache pool: {}", e)))?;

        Ok(Self {
            pool,
            max_wait_ms: settings.pool.max_wait,
            default_ttl: None,
            key_prefix: None,
        })
    }

    /// Borrow a pooled connection, reporting the configured wait on
    /// timeout.
    async fn connection(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| match e {
            deadpool_redis::PoolError::Timeout(_) => {
                StoreError::pool_exhausted("cache", self.max_wait_ms)
            }
            other => other.into(),
        })
    }

    /// Apply this TTL to every `set` that does not pass its own.
    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl = Some(secs);
        self
    }

    /// Prefix every key, so multiple applications can share one backend.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Fetch raw bytes. A missing key is `Ok(None)`.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    /// Store raw bytes, with an explicit TTL, the client default, or none.
    pub async fn set(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let key = self.full_key(key);
        match ttl_secs.or(self.default_ttl) {
            Some(secs) => {
                let _: () = conn.set_ex(&key, value, secs).await?;
            }
            None => {
                let _: () = conn.set(&key, value).await?;
            }
        }
        debug!(key = %key, "Cache entry written");
        Ok(())
    }

    /// Remove a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(self.full_key(key)).await?;
        Ok(removed > 0)
    }

    /// Encode a value through the codec and store it.
    pub async fn set_typed<T: Cacheable>(
        &self,
        codec: &CacheCodec,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> StoreResult<()> {
        let bytes = codec.serialize(value)?;
        self.set(key, &bytes, ttl_secs).await
    }

    /// Fetch a value and decode it as `T`. A missing key is `Ok(None)`.
    pub async fn get_typed<T: Cacheable>(
        &self,
        codec: &CacheCodec,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(codec.decode_as(&bytes)?)),
            None => Ok(None),
        }
    }
}
