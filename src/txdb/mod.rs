// ============================================================================
// Test-isolation wrapper
// ============================================================================
//
// `TxDb` confines every operation on a cluster to one transaction opened
// lazily on the primary. Nothing is ever committed: `rollback` discards all
// accumulated writes and `close` discards them before closing the cluster.
//
// State machine:
//
//   Unstarted --first call--> TransactionOpen --rollback--> Unstarted
//                                             --close-----> Closed
//
// One mutex guards the shared transaction. It is held while the
// transaction is begun and for the one delegated call (for `tx`, the whole
// closure), so at most one physical BEGIN happens per open transaction and
// two callers never use the transaction at the same time.
//
// Every delegated call runs with a context carrying the shared transaction.
// A transaction already in the caller's context is kept only when it lives on
// the same session (a savepoint opened through `tx`); any other is replaced.
//
// Calling back into the same `TxDb` from inside a `tx` closure deadlocks;
// use the `Querier` or `Context` handed to the closure instead.
//
// ============================================================================

use crate::cluster::Cluster;
use crate::core::{Error, MultiError, Result, Value};
use crate::interface::Conn;
use crate::querier::Querier;
use crate::result::{RowSet, ScanApi};
use crate::transaction::{Context, TxHandle, TxOptions};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Rollback-only view of a [`Cluster`].
///
/// ```
/// use pgcluster::prelude::*;
/// use pgcluster::prelude::drivers::{Connect, MemoryServer};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let server = MemoryServer::new("app");
/// let connectors = vec![Arc::new(server.clone()) as Arc<dyn Connect>];
/// let cluster = Cluster::connect(connectors, ClusterOptions::new()).await?;
/// let ctx = Context::background();
/// cluster.exec(&ctx, "CREATE TABLE notes (body TEXT)", params!()).await?;
///
/// let db = TxDb::new(cluster);
/// db.exec(&ctx, "INSERT INTO notes VALUES ('draft')", params!()).await?;
/// db.close().await?;
///
/// assert_eq!(server.row_count("notes")?, Some(0));
/// # Ok::<(), Error>(())
/// # }).unwrap();
/// ```
pub struct TxDb {
    cluster: Cluster,
    scan_api: Arc<ScanApi>,
    tx: Mutex<Option<TxHandle>>,
}

impl TxDb {
    pub fn new(cluster: Cluster) -> Self {
        let scan_api = Arc::clone(cluster.scan_api());
        Self {
            cluster,
            scan_api,
            tx: Mutex::new(None),
        }
    }

    /// The wrapped cluster. Statements sent through it bypass the isolation.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// The shared transaction, if one is open.
    pub async fn tx_handle(&self) -> Option<TxHandle> {
        self.tx.lock().await.clone()
    }

    /// `ctx` with the shared transaction in scope.
    fn scoped(ctx: &Context, shared: &TxHandle) -> Context {
        match ctx.tx() {
            Some(tx) if tx.shares_session(shared) && tx.is_active() => ctx.clone(),
            _ => ctx.with_tx(Some(shared.clone())),
        }
    }

    /// Opens the shared transaction if needed and returns a querier bound to
    /// it together with the scoped context.
    async fn enter(&self, ctx: &Context, slot: &mut Option<TxHandle>) -> Result<(Querier, Context)> {
        let shared = self.begin_once(ctx, slot).await?;
        let scoped = Self::scoped(ctx, &shared);
        Ok((Querier::from_tx(shared, Arc::clone(&self.scan_api)), scoped))
    }

    async fn begin_once(&self, ctx: &Context, slot: &mut Option<TxHandle>) -> Result<TxHandle> {
        if let Some(tx) = slot.as_ref().filter(|tx| tx.is_active()) {
            return Ok(tx.clone());
        }

        let tx = self
            .cluster
            .primary()
            .begin(&ctx.without_tx(), &TxOptions::new())
            .await?;
        debug!(tx = %tx.id(), endpoint = %tx.endpoint(), "isolation transaction opened");

        *slot = Some(tx.clone());
        Ok(tx)
    }

    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<RowSet> {
        let mut slot = self.tx.lock().await;
        let (querier, ctx) = self.enter(ctx, &mut slot).await?;
        querier.query(&ctx, sql, params).await
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>> {
        let mut slot = self.tx.lock().await;
        let (querier, ctx) = self.enter(ctx, &mut slot).await?;
        querier.select(&ctx, sql, params).await
    }

    pub async fn select_into<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        dst: &mut Vec<T>,
        sql: &str,
        params: &[Value],
    ) -> Result<()> {
        let mut slot = self.tx.lock().await;
        let (querier, ctx) = self.enter(ctx, &mut slot).await?;
        querier.select_into(&ctx, dst, sql, params).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<T> {
        let mut slot = self.tx.lock().await;
        let (querier, ctx) = self.enter(ctx, &mut slot).await?;
        querier.get(&ctx, sql, params).await
    }

    pub async fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        let mut slot = self.tx.lock().await;
        let (querier, ctx) = self.enter(ctx, &mut slot).await?;
        querier.exec(&ctx, sql, params).await
    }

    /// Runs `f` inside a savepoint of the shared transaction.
    ///
    /// An error from `f` undoes only what `f` did.
    pub async fn tx<F, Fut, T>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Context, Querier) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slot = self.tx.lock().await;
        let (querier, ctx) = self.enter(ctx, &mut slot).await?;
        querier.tx(&ctx, opts, f).await
    }

    /// A querier bound to the shared transaction, opening it if needed.
    pub async fn primary(&self, ctx: &Context) -> Result<Querier> {
        let mut slot = self.tx.lock().await;
        let shared = self.begin_once(ctx, &mut slot).await?;
        Ok(Querier::from_tx(shared, Arc::clone(&self.scan_api)))
    }

    /// Same as [`primary`](Self::primary): there is no read/write split while
    /// isolation is active.
    pub async fn replica(&self, ctx: &Context) -> Result<Querier> {
        self.primary(ctx).await
    }

    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.cluster.ping(ctx).await
    }

    /// Discards everything done since the shared transaction was opened.
    ///
    /// The next operation opens a fresh transaction. Without an open
    /// transaction this does nothing.
    pub async fn rollback(&self) -> Result<()> {
        let mut slot = self.tx.lock().await;
        let Some(tx) = slot.take() else {
            return Ok(());
        };
        debug!(tx = %tx.id(), "isolation transaction rolled back");
        match tx.rollback().await {
            Ok(()) | Err(Error::TxDone) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Rolls back, then closes the cluster. Both steps always run.
    pub async fn close(&self) -> Result<()> {
        let mut errors = MultiError::new();
        if let Err(err) = self.rollback().await {
            errors.push(err);
        }
        if let Err(err) = self.cluster.close().await {
            errors.push(err);
        }
        errors.into_result()
    }
}

#[async_trait]
impl Conn for TxDb {
    async fn select<T>(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        TxDb::select(self, ctx, sql, params).await
    }

    async fn select_into<T>(
        &self,
        ctx: &Context,
        dst: &mut Vec<T>,
        sql: &str,
        params: &[Value],
    ) -> Result<()>
    where
        T: DeserializeOwned + Send,
    {
        TxDb::select_into(self, ctx, dst, sql, params).await
    }

    async fn get<T>(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        TxDb::get(self, ctx, sql, params).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        TxDb::exec(self, ctx, sql, params).await
    }

    async fn tx<F, Fut, T>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Context, Querier) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        TxDb::tx(self, ctx, opts, f).await
    }

    async fn primary(&self, ctx: &Context) -> Result<Querier> {
        TxDb::primary(self, ctx).await
    }

    async fn replica(&self, ctx: &Context) -> Result<Querier> {
        TxDb::replica(self, ctx).await
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        TxDb::ping(self, ctx).await
    }

    async fn close(&self) -> Result<()> {
        TxDb::close(self).await
    }
}

impl std::fmt::Debug for TxDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxDb")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}
