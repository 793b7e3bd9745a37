//! Multi-store database layer: pools, registry, transactions, and the
//! named-statement binder.

pub mod binder;
pub mod params;
pub mod pool;
pub mod registry;
pub mod rows;
pub mod transaction;

pub use binder::{BindValue, QueryBinder, QueryBinderBuilder};
pub use params::QueryParam;
pub use pool::{PooledConnection, StorePool};
pub use registry::{StoreHandle, StoreRegistry};
pub use transaction::{
    DbTransaction, RollbackPolicy, TransactionRegistry, TransactionScope, TxHandle, WorkError,
};
