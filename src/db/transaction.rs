//! Transaction registry and transactional work scopes.
//!
//! A transaction lives in the [`TransactionRegistry`] under a generated id
//! from `begin` until `commit`, `rollback`, or expiry. Callers normally do
//! not touch the registry directly: [`TransactionScope::run`] wraps a unit of
//! work, opens the transaction, propagates it to nested scopes on the same
//! task, and decides the outcome from the unit's result.

use crate::db::params::{
    QueryParam, bind_mysql_param, bind_postgres_param, bind_sqlite_param,
};
use crate::db::pool::StorePool;
use crate::db::rows::RowToRecord;
use crate::error::{StoreError, StoreResult};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default transaction timeout: 5 minutes.
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 300;

/// Maximum allowed transaction timeout: 1 hour.
pub const MAX_TRANSACTION_TIMEOUT_SECS: u64 = 3600;

/// How often the reaper sweeps for expired transactions.
const REAPER_INTERVAL_SECS: u64 = 30;

/// Store and transaction id of an enclosing scope.
#[derive(Clone)]
struct TxContext {
    store: String,
    id: String,
}

tokio::task_local! {
    /// Context of the scope enclosing the current task, if any.
    static CURRENT_TX: TxContext;
}

/// An open transaction on one of the supported drivers.
pub enum DbTransaction {
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

impl DbTransaction {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> StoreResult<u64> {
        match self {
            DbTransaction::MySql(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                Ok(query.execute(&mut **tx).await?.rows_affected())
            }
            DbTransaction::Postgres(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                Ok(query.execute(&mut **tx).await?.rows_affected())
            }
            DbTransaction::Sqlite(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                Ok(query.execute(&mut **tx).await?.rows_affected())
            }
        }
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> StoreResult<Vec<serde_json::Map<String, JsonValue>>> {
        match self {
            DbTransaction::MySql(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(|r| r.to_record_map()).collect())
            }
            DbTransaction::Postgres(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(|r| r.to_record_map()).collect())
            }
            DbTransaction::Sqlite(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(|r| r.to_record_map()).collect())
            }
        }
    }

    async fn commit(self) -> StoreResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await?,
            DbTransaction::Postgres(tx) => tx.commit().await?,
            DbTransaction::Sqlite(tx) => tx.commit().await?,
        }
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await?,
            DbTransaction::Postgres(tx) => tx.rollback().await?,
            DbTransaction::Sqlite(tx) => tx.rollback().await?,
        }
        Ok(())
    }
}

/// A registered transaction awaiting completion.
struct ActiveTransaction {
    /// `None` once the transaction has been taken for commit/rollback.
    transaction: Option<DbTransaction>,
    store: String,
    created_at: Instant,
    timeout: Duration,
}

impl ActiveTransaction {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.timeout
    }
}

/// Registry of in-flight transactions, keyed by generated id.
pub struct TransactionRegistry {
    transactions: RwLock<HashMap<String, ActiveTransaction>>,
    reaper_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            reaper_handle: std::sync::Mutex::new(None),
        }
    }

    /// Open a transaction on the given store and register it.
    ///
    /// Returns the generated transaction id. The timeout is clamped to
    /// [`MAX_TRANSACTION_TIMEOUT_SECS`] and defaults to
    /// [`DEFAULT_TRANSACTION_TIMEOUT_SECS`].
    pub async fn begin(
        &self,
        pool: &StorePool,
        timeout: Option<Duration>,
    ) -> StoreResult<String> {
        let timeout = timeout
            .unwrap_or(Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS))
            .min(Duration::from_secs(MAX_TRANSACTION_TIMEOUT_SECS));
        let tx = pool.begin().await?;
        let id = format!("tx_{}", uuid::Uuid::new_v4().simple());

        let mut guard = self.transactions.write().await;
        guard.insert(
            id.clone(),
            ActiveTransaction {
                transaction: Some(tx),
                store: pool.name().to_string(),
                created_at: Instant::now(),
                timeout,
            },
        );
        debug!(store = %pool.name(), transaction = %id, "Transaction started");
        Ok(id)
    }

    /// Execute a statement inside a registered transaction.
    pub async fn execute(
        &self,
        id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> StoreResult<u64> {
        let mut guard = self.transactions.write().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::transaction("No active transaction", id))?;
        let tx = entry
            .transaction
            .as_mut()
            .ok_or_else(|| StoreError::transaction("Transaction already completed", id))?;
        tx.execute(sql, params).await
    }

    /// Run a query inside a registered transaction.
    pub async fn fetch_all(
        &self,
        id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> StoreResult<Vec<serde_json::Map<String, JsonValue>>> {
        let mut guard = self.transactions.write().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::transaction("No active transaction", id))?;
        let tx = entry
            .transaction
            .as_mut()
            .ok_or_else(|| StoreError::transaction("Transaction already completed", id))?;
        tx.fetch_all(sql, params).await
    }

    /// Commit a registered transaction and remove it from the registry.
    pub async fn commit(&self, id: &str) -> StoreResult<()> {
        let mut entry = self
            .transactions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::transaction("No active transaction", id))?;
        let tx = entry
            .transaction
            .take()
            .ok_or_else(|| StoreError::transaction("Transaction already completed", id))?;
        tx.commit().await?;
        debug!(store = %entry.store, transaction = %id, "Transaction committed");
        Ok(())
    }

    /// Roll back a registered transaction and remove it from the registry.
    pub async fn rollback(&self, id: &str) -> StoreResult<()> {
        let mut entry = self
            .transactions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::transaction("No active transaction", id))?;
        let tx = entry
            .transaction
            .take()
            .ok_or_else(|| StoreError::transaction("Transaction already completed", id))?;
        tx.rollback().await?;
        debug!(store = %entry.store, transaction = %id, "Transaction rolled back");
        Ok(())
    }

    /// Number of transactions currently registered.
    pub async fn active_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Roll back and drop every transaction that outlived its timeout.
    pub async fn reap_expired(&self) {
        let expired: Vec<(String, ActiveTransaction)> = {
            let mut guard = self.transactions.write().await;
            let ids: Vec<String> = guard
                .iter()
                .filter(|(_, entry)| entry.is_expired())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| guard.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, mut entry) in expired {
            warn!(
                store = %entry.store,
                transaction = %id,
                age_secs = entry.created_at.elapsed().as_secs(),
                "Rolling back expired transaction"
            );
            if let Some(tx) = entry.transaction.take() {
                if let Err(e) = tx.rollback().await {
                    warn!(transaction = %id, error = %e, "Expired transaction rollback failed");
                }
            }
        }
    }

    /// Spawn the background sweep for expired transactions.
    ///
    /// The task holds a weak reference, so it winds down once the registry
    /// is dropped.
    pub fn start_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(REAPER_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.reap_expired().await;
            }
        });
        if let Ok(mut slot) = self.reaper_handle.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Abort the reaper and roll back everything still registered.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.reaper_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let remaining: Vec<(String, ActiveTransaction)> = {
            let mut guard = self.transactions.write().await;
            guard.drain().collect()
        };
        for (id, mut entry) in remaining {
            if let Some(tx) = entry.transaction.take() {
                if let Err(e) = tx.rollback().await {
                    warn!(transaction = %id, error = %e, "Shutdown rollback failed");
                }
            }
        }
    }
}

/// Failure of a transactional unit of work, classified by severity.
///
/// `?` on a [`StoreError`] inside a unit produces [`WorkError::Fatal`];
/// a unit that wants the enclosing transaction to survive its failure
/// returns [`WorkError::Recoverable`] explicitly.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// The unit failed, but the transaction's work so far is still valid.
    #[error("{0}")]
    Recoverable(StoreError),
    /// The unit failed and the transaction must not commit.
    #[error("{0}")]
    Fatal(StoreError),
}

impl From<StoreError> for WorkError {
    fn from(err: StoreError) -> Self {
        WorkError::Fatal(err)
    }
}

impl WorkError {
    pub fn recoverable(err: StoreError) -> Self {
        WorkError::Recoverable(err)
    }

    pub fn into_inner(self) -> StoreError {
        match self {
            WorkError::Recoverable(e) | WorkError::Fatal(e) => e,
        }
    }
}

/// What a failed unit of work does to its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Roll back on [`WorkError::Fatal`] only; a recoverable failure still
    /// commits the work performed before it.
    #[default]
    FatalOnly,
    /// Roll back on any failure.
    OnAnyFailure,
}

/// Handle through which a unit of work runs statements in its transaction.
#[derive(Clone)]
pub struct TxHandle {
    store: String,
    id: String,
    registry: Arc<TransactionRegistry>,
}

impl TxHandle {
    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn transaction_id(&self) -> &str {
        &self.id
    }

    /// Execute a statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> StoreResult<u64> {
        self.registry.execute(&self.id, sql, params).await
    }

    /// Run a query and project rows into camelCase-keyed record maps.
    pub async fn fetch_all(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> StoreResult<Vec<serde_json::Map<String, JsonValue>>> {
        self.registry.fetch_all(&self.id, sql, params).await
    }

    /// Run a query expected to produce at most one row.
    ///
    /// No rows is `Ok(None)`, never an error.
    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> StoreResult<Option<serde_json::Map<String, JsonValue>>> {
        let mut rows = self.registry.fetch_all(&self.id, sql, params).await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }
}

/// Runs units of work transactionally against one store.
///
/// A scope invoked while another scope's unit is running on the same task
/// joins the enclosing transaction instead of opening its own; the outcome
/// is decided once, by the outermost scope.
#[derive(Clone)]
pub struct TransactionScope {
    store: String,
    pool: Arc<StorePool>,
    registry: Arc<TransactionRegistry>,
    policy: RollbackPolicy,
    timeout: Option<Duration>,
}

impl TransactionScope {
    pub fn new(pool: Arc<StorePool>, registry: Arc<TransactionRegistry>) -> Self {
        Self {
            store: pool.name().to_string(),
            pool,
            registry,
            policy: RollbackPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Run a unit of work inside a transaction.
    ///
    /// On success the transaction commits. On failure the rollback policy
    /// decides: with [`RollbackPolicy::FatalOnly`] a recoverable failure
    /// still commits, a fatal one rolls back.
    pub async fn run<T, F, Fut>(&self, unit: F) -> Result<T, WorkError>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = Result<T, WorkError>>,
    {
        // A scope for the same store already open on this task shares its
        // transaction. Each store has its own transaction machinery, so a
        // scope for a different store opens an independent transaction.
        if let Ok(enclosing) = CURRENT_TX.try_with(|ctx| ctx.clone()) {
            if enclosing.store == self.store {
                let handle = TxHandle {
                    store: self.store.clone(),
                    id: enclosing.id,
                    registry: self.registry.clone(),
                };
                return unit(handle).await;
            }
        }

        let id = self
            .registry
            .begin(&self.pool, self.timeout)
            .await
            .map_err(WorkError::Fatal)?;
        let handle = TxHandle {
            store: self.store.clone(),
            id: id.clone(),
            registry: self.registry.clone(),
        };

        let context = TxContext {
            store: self.store.clone(),
            id: id.clone(),
        };
        let result = CURRENT_TX.scope(context, unit(handle)).await;

        match &result {
            Ok(_) => {
                self.registry.commit(&id).await.map_err(WorkError::Fatal)?;
            }
            Err(WorkError::Recoverable(e)) => match self.policy {
                RollbackPolicy::FatalOnly => {
                    debug!(
                        store = %self.store,
                        transaction = %id,
                        error = %e,
                        "Recoverable failure, committing work performed so far"
                    );
                    self.registry.commit(&id).await.map_err(WorkError::Fatal)?;
                }
                RollbackPolicy::OnAnyFailure => {
                    self.rollback_logged(&id).await;
                }
            },
            Err(WorkError::Fatal(e)) => {
                debug!(
                    store = %self.store,
                    transaction = %id,
                    error = %e,
                    "Fatal failure, rolling back"
                );
                self.rollback_logged(&id).await;
            }
        }
        result
    }

    async fn rollback_logged(&self, id: &str) {
        if let Err(e) = self.registry.rollback(id).await {
            warn!(store = %self.store, transaction = %id, error = %e, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_VALIDATION_QUERY, Driver, PoolConfig};

    async fn sqlite_pool(dir: &tempfile::TempDir, name: &str) -> Arc<StorePool> {
        let path = dir.path().join(format!("{}.db", name));
        let config = PoolConfig {
            driver: Driver::Sqlite,
            url: format!("sqlite://{}", path.display()),
            username: String::new(),
            password: String::new(),
            initial_size: 1,
            max_active: 5,
            min_idle: 0,
            max_wait: Duration::from_millis(2000),
            keep_alive: false,
            validation_query: DEFAULT_VALIDATION_QUERY.to_string(),
        };
        let pool = Arc::new(StorePool::connect(name, config).await.unwrap());
        let mut conn = pool.acquire().await.unwrap();
        conn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)", &[])
            .await
            .unwrap();
        drop(conn);
        pool
    }

    #[tokio::test]
    async fn test_begin_execute_commit() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "commit").await;
        let registry = TransactionRegistry::new();

        let id = registry.begin(&pool, None).await.unwrap();
        let affected = registry
            .execute(
                &id,
                "INSERT INTO items (id, label) VALUES (?, ?)",
                &[QueryParam::Int(1), QueryParam::from("a")],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        registry.commit(&id).await.unwrap();
        assert_eq!(registry.active_count().await, 0);

        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "rollback").await;
        let registry = TransactionRegistry::new();

        let id = registry.begin(&pool, None).await.unwrap();
        registry
            .execute(
                &id,
                "INSERT INTO items (id, label) VALUES (?, ?)",
                &[QueryParam::Int(1), QueryParam::from("a")],
            )
            .await
            .unwrap();
        registry.rollback(&id).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transaction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _pool = sqlite_pool(&dir, "unknown").await;
        let registry = TransactionRegistry::new();
        let err = registry.execute("tx_missing", "SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Transaction { .. }));
    }

    #[tokio::test]
    async fn test_commit_twice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "twice").await;
        let registry = TransactionRegistry::new();
        let id = registry.begin(&pool, None).await.unwrap();
        registry.commit(&id).await.unwrap();
        assert!(registry.commit(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_reaper_rolls_back_expired() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "expired").await;
        let registry = TransactionRegistry::new();

        let id = registry
            .begin(&pool, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        registry
            .execute(
                &id,
                "INSERT INTO items (id, label) VALUES (?, ?)",
                &[QueryParam::Int(1), QueryParam::from("stale")],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.reap_expired().await;
        assert_eq!(registry.active_count().await, 0);

        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_scope_commits_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "scope_ok").await;
        let registry = Arc::new(TransactionRegistry::new());
        let scope = TransactionScope::new(pool.clone(), registry.clone());

        let inserted = scope
            .run(|tx| async move {
                tx.execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[QueryParam::Int(1), QueryParam::from("x")],
                )
                .await?;
                tx.execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[QueryParam::Int(2), QueryParam::from("y")],
                )
                .await?;
                Ok(2u64)
            })
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_scope_rolls_back_on_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "scope_fatal").await;
        let registry = Arc::new(TransactionRegistry::new());
        let scope = TransactionScope::new(pool.clone(), registry.clone());

        let result: Result<(), WorkError> = scope
            .run(|tx| async move {
                tx.execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[QueryParam::Int(1), QueryParam::from("x")],
                )
                .await?;
                // Duplicate key surfaces as a StoreError and converts to Fatal
                tx.execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[QueryParam::Int(1), QueryParam::from("dup")],
                )
                .await?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(WorkError::Fatal(_))));

        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_scope_commits_on_recoverable_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "scope_recoverable").await;
        let registry = Arc::new(TransactionRegistry::new());
        let scope = TransactionScope::new(pool.clone(), registry.clone());

        let result: Result<(), WorkError> = scope
            .run(|tx| async move {
                tx.execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[QueryParam::Int(1), QueryParam::from("kept")],
                )
                .await?;
                Err(WorkError::recoverable(StoreError::cache("soft failure")))
            })
            .await;
        assert!(matches!(result, Err(WorkError::Recoverable(_))));

        // FatalOnly policy: the insert before the recoverable failure persists
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT label FROM items", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["label"], serde_json::json!("kept"));
    }

    #[tokio::test]
    async fn test_scope_rollback_policy_on_any_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "scope_strict").await;
        let registry = Arc::new(TransactionRegistry::new());
        let scope = TransactionScope::new(pool.clone(), registry.clone())
            .with_policy(RollbackPolicy::OnAnyFailure);

        let result: Result<(), WorkError> = scope
            .run(|tx| async move {
                tx.execute(
                    "INSERT INTO items (id, label) VALUES (?, ?)",
                    &[QueryParam::Int(1), QueryParam::from("gone")],
                )
                .await?;
                Err(WorkError::recoverable(StoreError::cache("soft failure")))
            })
            .await;
        assert!(result.is_err());

        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_cross_store_scope_opens_independent_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let common = sqlite_pool(&dir, "common").await;
        let gateway = sqlite_pool(&dir, "gateway").await;
        let common_scope = TransactionScope::new(
            common.clone(),
            Arc::new(TransactionRegistry::new()),
        );
        let gateway_scope = TransactionScope::new(
            gateway.clone(),
            Arc::new(TransactionRegistry::new()),
        );

        let inner = gateway_scope.clone();
        common_scope
            .run(|tx| {
                let inner = inner.clone();
                async move {
                    let common_id = tx.transaction_id().to_string();
                    tx.execute(
                        "INSERT INTO items (id, label) VALUES (?, ?)",
                        &[QueryParam::Int(1), QueryParam::from("common")],
                    )
                    .await?;

                    // A different store gets its own transaction, not the
                    // enclosing one replayed against the wrong registry.
                    inner
                        .run(|gw_tx| {
                            let common_id = common_id.clone();
                            async move {
                                assert_ne!(gw_tx.transaction_id(), common_id);
                                gw_tx
                                    .execute(
                                        "INSERT INTO items (id, label) VALUES (?, ?)",
                                        &[QueryParam::Int(1), QueryParam::from("gateway")],
                                    )
                                    .await?;
                                Ok(())
                            }
                        })
                        .await?;
                    Ok(())
                }
            })
            .await
            .unwrap();

        // Both stores committed their own write
        let mut conn = common.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT label FROM items", &[]).await.unwrap();
        assert_eq!(rows[0]["label"], serde_json::json!("common"));
        drop(conn);
        let mut conn = gateway.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT label FROM items", &[]).await.unwrap();
        assert_eq!(rows[0]["label"], serde_json::json!("gateway"));
    }

    #[tokio::test]
    async fn test_nested_scope_joins_enclosing_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir, "nested").await;
        let registry = Arc::new(TransactionRegistry::new());
        let scope = TransactionScope::new(pool.clone(), registry.clone());

        let inner_scope = scope.clone();
        scope
            .run(|tx| {
                let inner_scope = inner_scope.clone();
                async move {
                    let outer_id = tx.transaction_id().to_string();
                    tx.execute(
                        "INSERT INTO items (id, label) VALUES (?, ?)",
                        &[QueryParam::Int(1), QueryParam::from("outer")],
                    )
                    .await?;

                    inner_scope
                        .run(|inner_tx| {
                            let outer_id = outer_id.clone();
                            async move {
                                assert_eq!(inner_tx.transaction_id(), outer_id);
                                inner_tx
                                    .execute(
                                        "INSERT INTO items (id, label) VALUES (?, ?)",
                                        &[QueryParam::Int(2), QueryParam::from("inner")],
                                    )
                                    .await?;
                                Ok(())
                            }
                        })
                        .await?;
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(registry.active_count().await, 0);
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn.fetch_all("SELECT id FROM items", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
