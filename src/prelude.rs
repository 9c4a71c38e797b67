//! Everything application code usually needs, in one import.
//!
//! `use pgcluster::prelude::*;`

pub use crate::params;
pub use crate::{
    Cluster, ClusterOptions, Conn, Context, Error, IsolationLevel, Querier, Result, ScanApi,
    TxDb, TxManager, TxOptions, Value, codes,
};

pub mod drivers {
    //! Capability traits and the bundled drivers, for custom backends and tests.
    pub use crate::driver::memory::MemoryServer;
    pub use crate::driver::postgres::PgConnector;
    pub use crate::driver::{Connect, Pool, Session};
}
