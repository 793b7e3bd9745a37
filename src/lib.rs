//! Multi-store persistence core.
//!
//! This crate gives an application concurrent access to several named
//! relational stores plus a shared cache:
//!
//! - [`StoreRegistry`] keeps one bounded, validated connection pool per
//!   logical store, with eager warm-up and background keep-alive.
//! - [`TransactionScope`] runs units of work transactionally, joining
//!   nested scopes on the same task into one transaction and deciding
//!   commit or rollback from the unit's outcome.
//! - [`QueryBinder`] maps operation names to SQL with `:name` parameters
//!   and projects rows into camelCase-keyed records.
//! - [`CacheClient`] and [`CacheCodec`] store values in the shared cache
//!   with their concrete Rust type preserved through an envelope
//!   discriminator.
//!
//! Configuration is a single YAML document parsed by
//! [`Settings::from_yaml_str`].

pub mod cache;
pub mod config;
pub mod db;
pub mod error;

pub use cache::{CacheClient, CacheCodec, CacheValue, Cacheable};
pub use config::{DataSourceSettings, Driver, PoolConfig, Settings};
pub use db::{
    BindValue, PooledConnection, QueryBinder, QueryParam, RollbackPolicy, StoreHandle,
    StorePool, StoreRegistry, TransactionRegistry, TransactionScope, TxHandle, WorkError,
};
pub use error::{StoreError, StoreResult};
