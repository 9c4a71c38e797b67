// ============================================================================
// pgcluster Library
// ============================================================================
//
// A single logical connection over a PostgreSQL primary and its replicas:
//
// - writes and transactions go to the primary
// - reads are spread over the replicas in round-robin order
// - transactions travel with the call `Context`, so nested calls join them
//   and nested `tx` calls become savepoints
// - `TxDb` turns a whole cluster into one rollback-only transaction for tests
//
// ============================================================================

pub mod core;
pub mod result;
pub mod driver;
pub mod connection;
pub mod transaction;
pub mod querier;
pub mod cluster;
pub mod txdb;
pub mod interface;
pub mod prelude;

// Re-export main types for convenience
pub use core::{DriverError, Error, MultiError, Result, TxOp, Value, codes};
pub use result::{RowSet, ScanApi};
pub use connection::{PhysicalConnection, Role, config::{ClusterConfig, PoolConfig}};
pub use transaction::{
    CancelHandle, Context, IsolationLevel, TxGuard, TxHandle, TxManager, TxOptions,
};
pub use querier::Querier;
pub use cluster::{Cluster, ClusterOptions, ConnPicker};
pub use txdb::TxDb;
pub use interface::Conn;
