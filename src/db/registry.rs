//! Registry of named stores.
//!
//! The [`StoreRegistry`] owns one [`StoreHandle`] per registered store. Each
//! handle bundles the store's pool, its transaction machinery, and the
//! keep-alive task that pings the pool while it sits idle. Stores register
//! independently; a failure to bring one up never disturbs the others.

use crate::config::{DEFAULT_KEEP_ALIVE_INTERVAL_SECS, DataSourceSettings, PoolConfig};
use crate::db::pool::{PooledConnection, StorePool};
use crate::db::transaction::{TransactionRegistry, TransactionScope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// One registered store: pool, transaction scope, keep-alive task.
pub struct StoreHandle {
    name: String,
    pool: Arc<StorePool>,
    transactions: Arc<TransactionRegistry>,
    keepalive_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StoreHandle {
    async fn open(name: &str, config: PoolConfig) -> StoreResult<Self> {
        let keep_alive = config.keep_alive;
        let pool = Arc::new(StorePool::connect(name, config).await?);
        let transactions = Arc::new(TransactionRegistry::new());
        transactions.start_reaper();

        let handle = Self {
            name: name.to_string(),
            pool,
            transactions,
            keepalive_handle: std::sync::Mutex::new(None),
        };
        if keep_alive {
            handle.start_keepalive();
        }
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<StorePool> {
        &self.pool
    }

    /// Borrow a connection from this store's pool.
    pub async fn acquire(&self) -> StoreResult<PooledConnection> {
        self.pool.acquire().await
    }

    /// Transaction scope bound to this store.
    pub fn scope(&self) -> TransactionScope {
        TransactionScope::new(self.pool.clone(), self.transactions.clone())
    }

    pub fn transactions(&self) -> &Arc<TransactionRegistry> {
        &self.transactions
    }

    /// Spawn the periodic validation ping.
    ///
    /// The task holds only a weak pool reference and stops once the handle
    /// is dropped or the pool closes.
    fn start_keepalive(&self) {
        let weak: Weak<StorePool> = Arc::downgrade(&self.pool);
        let store = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                DEFAULT_KEEP_ALIVE_INTERVAL_SECS,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                if let Err(e) = pool.ping().await {
                    warn!(store = %store, error = %e, "Keep-alive ping failed");
                }
            }
        });
        if let Ok(mut slot) = self.keepalive_handle.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    async fn close(&self) {
        if let Ok(mut slot) = self.keepalive_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.transactions.shutdown().await;
        self.pool.close().await;
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("driver", &self.pool.driver())
            .finish()
    }
}

/// Registry mapping store names to their handles.
pub struct StoreRegistry {
    stores: RwLock<HashMap<String, Arc<StoreHandle>>>,
    shutting_down: AtomicBool,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register every store named in the configuration.
    ///
    /// Stores come up independently; the first failure aborts registration
    /// and is returned, with already-registered stores left in place.
    pub async fn register_all(&self, settings: &DataSourceSettings) -> StoreResult<()> {
        for (name, config) in settings.pool_configs()? {
            self.register(&name, config).await?;
        }
        Ok(())
    }

    /// Register one named store, connecting and warming its pool.
    ///
    /// Duplicate names are a configuration error.
    pub async fn register(&self, name: &str, config: PoolConfig) -> StoreResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StoreError::configuration(
                "Registry is shutting down, no new stores accepted",
            ));
        }
        {
            let guard = self.stores.read().await;
            if guard.contains_key(name) {
                return Err(StoreError::configuration(format!(
                    "Store '{}' is already registered",
                    name
                )));
            }
        }

        // The pool is built outside the lock, so the name is re-checked
        // before insertion. The loser of a race closes its pool.
        let handle = Arc::new(StoreHandle::open(name, config).await?);

        let mut guard = self.stores.write().await;
        if guard.contains_key(name) {
            drop(guard);
            handle.close().await;
            return Err(StoreError::configuration(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        guard.insert(name.to_string(), handle.clone());
        drop(guard);

        info!(
            store = %name,
            driver = %handle.pool().driver(),
            max_active = handle.pool().config().max_active,
            "Store registered"
        );
        Ok(())
    }

    /// Look up the handle for a named store.
    pub async fn handle(&self, name: &str) -> StoreResult<Arc<StoreHandle>> {
        let guard = self.stores.read().await;
        guard.get(name).cloned().ok_or_else(|| {
            StoreError::configuration(format!("No store named '{}' is registered", name))
        })
    }

    /// Borrow a connection from a named store's pool.
    pub async fn acquire(&self, name: &str) -> StoreResult<PooledConnection> {
        self.handle(name).await?.acquire().await
    }

    /// Transaction scope for a named store.
    pub async fn scope(&self, name: &str) -> StoreResult<TransactionScope> {
        Ok(self.handle(name).await?.scope())
    }

    /// Names of every registered store.
    pub async fn store_names(&self) -> Vec<String> {
        self.stores.read().await.keys().cloned().collect()
    }

    /// Close every store: stop background tasks, roll back in-flight
    /// transactions, drain the pools.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<Arc<StoreHandle>> = {
            let mut guard = self.stores.write().await;
            guard.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            debug!(store = %handle.name(), "Closing store");
            handle.close().await;
        }
        info!("Store registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_VALIDATION_QUERY, Driver};

    fn sqlite_config(dir: &tempfile::TempDir, name: &str, max: u32) -> PoolConfig {
        let path = dir.path().join(format!("{}.db", name));
        PoolConfig {
            driver: Driver::Sqlite,
            url: format!("sqlite://{}", path.display()),
            username: String::new(),
            password: String::new(),
            initial_size: 1,
            max_active: max,
            min_idle: 0,
            max_wait: Duration::from_millis(500),
            keep_alive: false,
            validation_query: DEFAULT_VALIDATION_QUERY.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();
        registry
            .register("common", sqlite_config(&dir, "common", 3))
            .await
            .unwrap();
        let conn = registry.acquire("common").await.unwrap();
        conn.release();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();
        registry
            .register("common", sqlite_config(&dir, "common", 3))
            .await
            .unwrap();
        let err = registry
            .register("common", sqlite_config(&dir, "common2", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_store_rejected() {
        let registry = StoreRegistry::new();
        let err = registry.acquire("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_stores_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();
        registry
            .register("small", sqlite_config(&dir, "small", 1))
            .await
            .unwrap();
        registry
            .register("large", sqlite_config(&dir, "large", 5))
            .await
            .unwrap();

        // Exhaust the small store entirely
        let held = registry.acquire("small").await.unwrap();
        let err = registry.acquire("small").await.unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted { .. }));

        // The large store is unaffected
        let conn = registry.acquire("large").await.unwrap();
        conn.release();
        held.release();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_after_shutdown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();
        registry.shutdown().await;
        let err = registry
            .register("late", sqlite_config(&dir, "late", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
    }
}
