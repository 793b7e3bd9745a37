//! Error types for the multi-store persistence core.
//!
//! This module defines all error types using `thiserror` for ergonomic error
//! handling. Every failure the caller can observe is a distinct, matchable
//! variant; nothing is silently downgraded to a log line except background
//! keep-alive failures, which the pool retries on its own.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Missing or duplicate store name, malformed URL or credentials.
    /// Fatal, surfaced at registration time, never retried.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Borrow timed out waiting for pool capacity. Retryable; the caller
    /// decides the backoff policy.
    #[error("Pool '{store}' exhausted: no connection became available within {waited_ms}ms")]
    PoolExhausted { store: String, waited_ms: u64 },

    /// No healthy connection could be produced for the store, even after the
    /// pool evicted and replaced dead ones.
    #[error("Connection validation failed for store '{store}': {message}")]
    ConnectionValidation { store: String, message: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    /// Statement execution failure. Distinct from "no rows found", which is
    /// never an error.
    #[error("Query error: {message}")]
    Query {
        message: String,
        /// e.g. "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Cache error: {message}")]
    Cache { message: String },

    /// A cache payload carried a type discriminator that does not resolve to
    /// a registered type. Explicit failure, never coerced to a generic shape.
    #[error("Unresolved cache type discriminator: '{discriminator}'")]
    DeserializationTypeMismatch { discriminator: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool exhaustion error.
    pub fn pool_exhausted(store: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            store: store.into(),
            waited_ms,
        }
    }

    /// Create a connection validation error.
    pub fn validation(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionValidation {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a query error without an SQLSTATE code.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql_state: None,
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a discriminator mismatch error.
    pub fn type_mismatch(discriminator: impl Into<String>) -> Self {
        Self::DeserializationTypeMismatch {
            discriminator: discriminator.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retryable from the caller's perspective.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ConnectionValidation { .. }
        )
    }
}

/// Convert sqlx errors to StoreError.
///
/// Pool timeouts are mapped at the acquire site where the store name and
/// configured wait are known; this conversion covers statement execution and
/// connection-level failures flowing out of `?`.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => StoreError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                StoreError::Query {
                    message: db_err.message().to_string(),
                    sql_state: code,
                }
            }
            sqlx::Error::RowNotFound => StoreError::query("No rows returned"),
            sqlx::Error::PoolTimedOut => StoreError::pool_exhausted("unknown", 0),
            sqlx::Error::PoolClosed => StoreError::configuration("Connection pool is closed"),
            sqlx::Error::Io(io_err) => StoreError::query(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => StoreError::query(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => StoreError::query(format!("Protocol error: {}", msg)),
            sqlx::Error::ColumnNotFound(col) => {
                StoreError::query(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => StoreError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                StoreError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                StoreError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => StoreError::internal("Database worker crashed"),
            _ => StoreError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::cache(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Timeout(_) => StoreError::pool_exhausted("cache", 0),
            other => StoreError::cache(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::cache(format!("Serialization failure: {}", err))
    }
}

/// Result type alias for persistence operations.
pub type StoreResult<T> = Result<T, StoreError>;
