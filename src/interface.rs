use crate::core::{Result, Value};
use crate::querier::Querier;
use crate::transaction::{Context, TxOptions};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;

/// One logical connection: a [`Cluster`](crate::Cluster) or its test-isolation
/// wrapper [`TxDb`](crate::TxDb).
///
/// Code written against `Conn` runs unchanged in production and inside an
/// isolated test transaction.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Scans every returned row into a new vector.
    async fn select<T>(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send;

    /// Scans every returned row into `dst`, replacing its contents.
    async fn select_into<T>(
        &self,
        ctx: &Context,
        dst: &mut Vec<T>,
        sql: &str,
        params: &[Value],
    ) -> Result<()>
    where
        T: DeserializeOwned + Send;

    /// Scans exactly one row.
    async fn get<T>(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<T>
    where
        T: DeserializeOwned + Send;

    /// Runs a statement on the primary and returns the affected-row count.
    async fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64>;

    /// Runs `f` in a transaction on the primary. The context passed to `f`
    /// carries that transaction.
    async fn tx<F, Fut, T>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Context, Querier) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send;

    async fn primary(&self, ctx: &Context) -> Result<Querier>;

    async fn replica(&self, ctx: &Context) -> Result<Querier>;

    async fn ping(&self, ctx: &Context) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
