// ============================================================================
// Driver capability boundary
// ============================================================================
//
// The cluster layer never talks to a wire protocol directly. It consumes
// three capabilities:
//
// - Connect: opens a pool for one endpoint
// - Pool:    hands out sessions, pings and closes
// - Session: one physical connection executing SQL
//
// `postgres` implements them on top of sqlx; `memory` is an in-process
// engine used by the test suite.
//
// ============================================================================

pub mod memory;
pub mod postgres;

use crate::core::{Result, Value};
use crate::result::RowSet;
use async_trait::async_trait;
use std::sync::Arc;

/// Opens the pool for one configured endpoint.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Pool>>;

    /// Endpoint identity without credentials, for diagnostics.
    fn endpoint(&self) -> String;
}

/// An opened pool of physical sessions against one endpoint.
#[async_trait]
pub trait Pool: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Checks a session out of the pool. Fails with [`Error::Closed`](crate::Error::Closed)
    /// once the pool has been closed.
    async fn acquire(&self) -> Result<Box<dyn Session>>;

    async fn ping(&self) -> Result<()>;

    /// Closes the pool. Closing twice is not an error.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// One physical database session.
///
/// Dropping a session returns it to its pool.
#[async_trait]
pub trait Session: Send {
    /// Runs a parameterized statement and buffers every returned row.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet>;

    /// Runs a parameterized statement and returns the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Runs a statement over the simple query protocol, without preparing it.
    async fn execute_simple(&mut self, sql: &str) -> Result<()>;

    async fn begin(&mut self, statement: &str) -> Result<()> {
        self.execute_simple(statement).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute_simple("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute_simple("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.execute_simple(&format!("SAVEPOINT {}", name)).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.execute_simple(&format!("RELEASE SAVEPOINT {}", name))
            .await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.execute_simple(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }
}
