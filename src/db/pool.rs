//! Connection pools for logical stores.
//!
//! Each registered store owns one [`StorePool`], a driver-dispatched wrapper
//! around the underlying sqlx pool. Sizing and timeouts come from the shared
//! [`PoolConfig`]: `maxActive` bounds total connections, `minIdle` connections
//! are retained through idle reclamation, and borrows wait at most `maxWait`
//! before failing with [`StoreError::PoolExhausted`].

use crate::config::{DEFAULT_IDLE_TIMEOUT_SECS, Driver, PoolConfig};
use crate::db::params::{
    QueryParam, bind_mysql_param, bind_postgres_param, bind_sqlite_param,
};
use crate::db::rows::RowToRecord;
use crate::db::transaction::DbTransaction;
use crate::error::{StoreError, StoreResult};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// A bounded connection pool for one named store.
pub struct StorePool {
    name: String,
    config: PoolConfig,
    inner: DbPool,
}

enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl StorePool {
    /// Create the pool for a store and verify basic reachability.
    ///
    /// Unreachable backends surface here as a connect or warm-up failure, so
    /// a store that registers successfully is known good.
    pub async fn connect(name: &str, config: PoolConfig) -> StoreResult<Self> {
        let idle_timeout = Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));
        let inner = match config.driver {
            Driver::MySql => {
                let mut opts = MySqlConnectOptions::from_str(&config.url)?;
                if !config.username.is_empty() {
                    opts = opts.username(&config.username);
                }
                if !config.password.is_empty() {
                    opts = opts.password(&config.password);
                }
                let pool = MySqlPoolOptions::new()
                    .max_connections(config.max_active)
                    .min_connections(config.min_idle)
                    .acquire_timeout(config.max_wait)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(true)
                    .connect_with(opts)
                    .await?;
                DbPool::MySql(pool)
            }
            Driver::Postgres => {
                let mut opts = PgConnectOptions::from_str(&config.url)?;
                if !config.username.is_empty() {
                    opts = opts.username(&config.username);
                }
                if !config.password.is_empty() {
                    opts = opts.password(&config.password);
                }
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_active)
                    .min_connections(config.min_idle)
                    .acquire_timeout(config.max_wait)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(true)
                    .connect_with(opts)
                    .await?;
                DbPool::Postgres(pool)
            }
            Driver::Sqlite => {
                let opts =
                    SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_active)
                    .min_connections(config.min_idle)
                    .acquire_timeout(config.max_wait)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(true)
                    .connect_with(opts)
                    .await?;
                DbPool::Sqlite(pool)
            }
        };

        let pool = Self {
            name: name.to_string(),
            config,
            inner,
        };
        pool.warm_up().await?;
        Ok(pool)
    }

    /// Eagerly establish `initialSize` validated connections.
    ///
    /// The connections are held simultaneously so the pool really contains
    /// that many, then returned. A failure here is a registration failure.
    async fn warm_up(&self) -> StoreResult<()> {
        let mut held = Vec::with_capacity(self.config.initial_size as usize);
        for _ in 0..self.config.initial_size {
            let mut conn = self.acquire().await.map_err(|e| {
                StoreError::configuration(format!(
                    "Store '{}' failed to establish its initial connections: {}",
                    self.name, e
                ))
            })?;
            conn.validate(&self.config.validation_query)
                .await
                .map_err(|e| {
                    StoreError::configuration(format!(
                        "Store '{}' failed warm-up validation: {}",
                        self.name, e
                    ))
                })?;
            held.push(conn);
        }
        tracing::debug!(
            store = %self.name,
            connections = held.len(),
            "Pool warmed up"
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> Driver {
        self.config.driver
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current total connections held by the pool.
    pub fn size(&self) -> u32 {
        match &self.inner {
            DbPool::MySql(p) => p.size(),
            DbPool::Postgres(p) => p.size(),
            DbPool::Sqlite(p) => p.size(),
        }
    }

    /// Connections currently idle in the pool.
    pub fn num_idle(&self) -> usize {
        match &self.inner {
            DbPool::MySql(p) => p.num_idle(),
            DbPool::Postgres(p) => p.num_idle(),
            DbPool::Sqlite(p) => p.num_idle(),
        }
    }

    /// Borrow a validated connection, waiting at most `maxWait`.
    pub async fn acquire(&self) -> StoreResult<PooledConnection> {
        let result = match &self.inner {
            DbPool::MySql(p) => p.acquire().await.map(PooledConnection::MySql),
            DbPool::Postgres(p) => p.acquire().await.map(PooledConnection::Postgres),
            DbPool::Sqlite(p) => p.acquire().await.map(PooledConnection::Sqlite),
        };
        result.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => StoreError::pool_exhausted(
                self.name.clone(),
                self.config.max_wait.as_millis() as u64,
            ),
            other => other.into(),
        })
    }

    /// Open a transaction on a dedicated connection from this pool.
    pub async fn begin(&self) -> StoreResult<DbTransaction> {
        let tx = match &self.inner {
            DbPool::MySql(p) => DbTransaction::MySql(p.begin().await?),
            DbPool::Postgres(p) => DbTransaction::Postgres(p.begin().await?),
            DbPool::Sqlite(p) => DbTransaction::Sqlite(p.begin().await?),
        };
        Ok(tx)
    }

    /// Run the validation query on a borrowed connection.
    ///
    /// Used by the keep-alive task to exercise the pool while a store sits
    /// idle, so reclamation never drops it below a working set.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.acquire().await?;
        conn.validate(&self.config.validation_query)
            .await
            .map_err(|e| StoreError::validation(self.name.clone(), e.to_string()))
    }

    /// Close all connections. In-flight borrows complete first.
    pub async fn close(&self) {
        match &self.inner {
            DbPool::MySql(p) => p.close().await,
            DbPool::Postgres(p) => p.close().await,
            DbPool::Sqlite(p) => p.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            DbPool::MySql(p) => p.is_closed(),
            DbPool::Postgres(p) => p.is_closed(),
            DbPool::Sqlite(p) => p.is_closed(),
        }
    }
}

impl std::fmt::Debug for StorePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePool")
            .field("name", &self.name)
            .field("driver", &self.config.driver)
            .field("max_active", &self.config.max_active)
            .finish()
    }
}

/// A connection borrowed from a [`StorePool`].
///
/// Dropping the value returns the connection to the pool; [`release`] exists
/// to make that hand-back explicit at call sites that want it.
///
/// [`release`]: PooledConnection::release
pub enum PooledConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let driver = match self {
            PooledConnection::MySql(_) => Driver::MySql,
            PooledConnection::Postgres(_) => Driver::Postgres,
            PooledConnection::Sqlite(_) => Driver::Sqlite,
        };
        f.debug_struct("PooledConnection")
            .field("driver", &driver)
            .finish()
    }
}

impl PooledConnection {
    /// Execute a statement, returning the affected row count.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> StoreResult<u64> {
        match self {
            PooledConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                Ok(query.execute(&mut **conn).await?.rows_affected())
            }
            PooledConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                Ok(query.execute(&mut **conn).await?.rows_affected())
            }
            PooledConnection::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                Ok(query.execute(&mut **conn).await?.rows_affected())
            }
        }
    }

    /// Run a query and project every row into a camelCase-keyed record map.
    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> StoreResult<Vec<serde_json::Map<String, JsonValue>>> {
        match self {
            PooledConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                let rows = query.fetch_all(&mut **conn).await?;
                Ok(rows.iter().map(|r| r.to_record_map()).collect())
            }
            PooledConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                let rows = query.fetch_all(&mut **conn).await?;
                Ok(rows.iter().map(|r| r.to_record_map()).collect())
            }
            PooledConnection::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                let rows = query.fetch_all(&mut **conn).await?;
                Ok(rows.iter().map(|r| r.to_record_map()).collect())
            }
        }
    }

    /// Run a validation statement on this connection.
    pub async fn validate(&mut self, validation_query: &str) -> StoreResult<()> {
        match self {
            PooledConnection::MySql(conn) => {
                sqlx::query(validation_query).execute(&mut **conn).await?;
            }
            PooledConnection::Postgres(conn) => {
                sqlx::query(validation_query).execute(&mut **conn).await?;
            }
            PooledConnection::Sqlite(conn) => {
                sqlx::query(validation_query).execute(&mut **conn).await?;
            }
        }
        Ok(())
    }

    /// Return the connection to its pool.
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_VALIDATION_QUERY;

    fn sqlite_config(path: &str, initial: u32, max: u32, wait_ms: u64) -> PoolConfig {
        PoolConfig {
            driver: Driver::Sqlite,
            url: format!("sqlite://{}", path),
            username: String::new(),
            password: String::new(),
            initial_size: initial,
            max_active: max,
            min_idle: 0,
            max_wait: Duration::from_millis(wait_ms),
            keep_alive: false,
            validation_query: DEFAULT_VALIDATION_QUERY.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_and_warm_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.db");
        let config = sqlite_config(path.to_str().unwrap(), 2, 5, 2000);
        let pool = StorePool::connect("warm", config).await.unwrap();
        assert!(pool.size() >= 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exhaust.db");
        let config = sqlite_config(path.to_str().unwrap(), 1, 1, 200);
        let pool = StorePool::connect("exhaust", config).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        match err {
            StoreError::PoolExhausted { store, waited_ms } => {
                assert_eq!(store, "exhaust");
                assert_eq!(waited_ms, 200);
            }
            other => panic!("expected PoolExhausted, got {:?}", other),
        }
        held.release();

        // Capacity is available again after release
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_execute_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.db");
        let config = sqlite_config(path.to_str().unwrap(), 1, 3, 1000);
        let pool = StorePool::connect("exec", config).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        conn.execute(
            "CREATE TABLE sys_dict (dict_id INTEGER PRIMARY KEY, dict_name TEXT)",
            &[],
        )
        .await
        .unwrap();
        let affected = conn
            .execute(
                "INSERT INTO sys_dict (dict_id, dict_name) VALUES (?, ?)",
                &[QueryParam::Int(1), QueryParam::from("voltage")],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = conn
            .fetch_all("SELECT dict_id, dict_name FROM sys_dict", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["dictId"], serde_json::json!(1));
        assert_eq!(rows[0]["dictName"], serde_json::json!("voltage"));
        drop(conn);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_ping_runs_validation_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ping.db");
        let config = sqlite_config(path.to_str().unwrap(), 1, 2, 1000);
        let pool = StorePool::connect("ping", config).await.unwrap();
        pool.ping().await.unwrap();
        pool.close().await;
    }
}
