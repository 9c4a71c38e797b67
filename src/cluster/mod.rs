// ============================================================================
// Cluster topology
// ============================================================================
//
// One logical connection over N physical ones. Index 0 is the primary and
// takes every write and transaction; indices 1..N are replicas and serve
// reads in round-robin order. With a single connection the primary doubles
// as the only replica.
//
// Open, ping and close fan out over every connection at once and aggregate
// their failures.
//
// ============================================================================

pub mod options;
pub mod scatter;

pub use options::ClusterOptions;
pub use scatter::{scatter, scatter_slots};

use crate::connection::PhysicalConnection;
use crate::core::{Error, Result, Value};
use crate::driver::postgres::PgConnector;
use crate::driver::{Connect, Pool};
use crate::interface::Conn;
use crate::querier::Querier;
use crate::result::{RowSet, ScanApi};
use crate::transaction::{Context, TxOptions};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Chooses the querier serving a read, given the statement text.
pub type ConnPicker = Arc<dyn Fn(&Cluster, &str) -> Querier + Send + Sync>;

struct ClusterInner {
    connections: Vec<PhysicalConnection>,
    queriers: Vec<Querier>,
    picker: Option<ConnPicker>,
    scan_api: Arc<ScanApi>,
    counter: AtomicU64,
}

/// Cheap to clone; clones share connections and the replica counter.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

/// Round-robin replica index for a cluster of `n` connections.
///
/// Never 0 when `n > 1`; cycles 1, 2, .., n-1 as `counter` grows.
pub fn replica_index(n: usize, counter: &AtomicU64) -> usize {
    if n <= 1 {
        return 0;
    }
    let tick = counter.fetch_add(1, Ordering::Relaxed);
    1 + (tick % (n as u64 - 1)) as usize
}

impl Cluster {
    /// Parses every connection string, then opens them all concurrently.
    ///
    /// A malformed entry fails with [`Error::Config`] carrying its 1-based
    /// position, before any connection is attempted.
    pub async fn open<S: AsRef<str>>(dsns: &[S], options: ClusterOptions) -> Result<Self> {
        options.pool.validate().map_err(Error::InvalidConfig)?;

        let connectors = dsns
            .iter()
            .enumerate()
            .map(|(idx, dsn)| {
                PgConnector::from_dsn(dsn.as_ref(), options.pool.clone())
                    .map(|c| Arc::new(c) as Arc<dyn Connect>)
                    .map_err(|message| Error::Config {
                        index: idx + 1,
                        message,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::connect(connectors, options).await
    }

    /// Opens one pool per connector concurrently.
    ///
    /// If any of them fails, the ones that did open are closed again and the
    /// aggregated failures are returned.
    pub async fn connect(connectors: Vec<Arc<dyn Connect>>, options: ClusterOptions) -> Result<Self> {
        if connectors.is_empty() {
            return Err(Error::EmptyCluster);
        }

        let mut slots: Vec<Option<Arc<dyn Pool>>> = vec![None; connectors.len()];
        let connectors = &connectors;
        let opened = scatter_slots(&mut slots, |idx, slot| async move {
            *slot = Some(connectors[idx].connect().await?);
            Ok(())
        })
        .await;

        if let Err(errors) = opened {
            let pools: Vec<Arc<dyn Pool>> = slots.into_iter().flatten().collect();
            // Best effort: the open failures are what the caller needs.
            let _ = scatter(pools.len(), |idx| pools[idx].close()).await;
            return Err(Error::Aggregate(errors));
        }

        Self::from_pools(slots.into_iter().flatten().collect(), options)
    }

    /// Builds a cluster over already opened pools; the first is the primary.
    pub fn from_pools(pools: Vec<Arc<dyn Pool>>, options: ClusterOptions) -> Result<Self> {
        if pools.is_empty() {
            return Err(Error::EmptyCluster);
        }

        let scan_api = options.scan_api.unwrap_or_else(ScanApi::default_api);
        let connections: Vec<PhysicalConnection> = pools
            .into_iter()
            .enumerate()
            .map(|(idx, pool)| PhysicalConnection::new(idx, pool))
            .collect();
        let queriers = connections
            .iter()
            .map(|conn| Querier::from_pool(Arc::clone(conn.pool()), Arc::clone(&scan_api)))
            .collect();

        debug!(
            primary = %connections[0].endpoint(),
            replicas = connections.len() - 1,
            "cluster opened"
        );

        Ok(Self {
            inner: Arc::new(ClusterInner {
                connections,
                queriers,
                picker: options.picker,
                scan_api,
                counter: AtomicU64::new(0),
            }),
        })
    }

    /// Pings every connection concurrently.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        let connections = &self.inner.connections;
        scatter(connections.len(), |idx| ctx.run(connections[idx].ping())).await?;
        Ok(())
    }

    /// Closes every connection concurrently. Closing twice is not an error.
    pub async fn close(&self) -> Result<()> {
        let connections = &self.inner.connections;
        let result = scatter(connections.len(), |idx| connections[idx].close()).await;
        debug!(connections = connections.len(), ok = result.is_ok(), "cluster closed");
        result?;
        Ok(())
    }

    /// The querier bound to connection 0.
    pub fn primary(&self) -> Querier {
        self.inner.queriers[0].clone()
    }

    /// The next replica in round-robin order.
    pub fn replica(&self) -> Querier {
        let idx = replica_index(self.inner.queriers.len(), &self.inner.counter);
        self.inner.queriers[idx].clone()
    }

    fn pick(&self, sql: &str) -> Querier {
        match &self.inner.picker {
            Some(picker) => picker(self, sql),
            None => self.replica(),
        }
    }

    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.pick(sql).query(ctx, sql, params).await
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>> {
        self.pick(sql).select(ctx, sql, params).await
    }

    pub async fn select_into<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        dst: &mut Vec<T>,
        sql: &str,
        params: &[Value],
    ) -> Result<()> {
        self.pick(sql).select_into(ctx, dst, sql, params).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<T> {
        self.pick(sql).get(ctx, sql, params).await
    }

    /// Always runs on the primary.
    pub async fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        self.primary().exec(ctx, sql, params).await
    }

    /// Always opens the transaction on the primary.
    pub async fn tx<F, Fut, T>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Context, Querier) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.primary().tx(ctx, opts, f).await
    }

    pub fn connections(&self) -> &[PhysicalConnection] {
        &self.inner.connections
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn scan_api(&self) -> &Arc<ScanApi> {
        &self.inner.scan_api
    }
}

#[async_trait]
impl Conn for Cluster {
    async fn select<T>(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        Cluster::select(self, ctx, sql, params).await
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
        Cluster::select_into(self, ctx, dst, sql, params).await
    }

    async fn get<T>(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        Cluster::get(self, ctx, sql, params).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        Cluster::exec(self, ctx, sql, params).await
    }

    async fn tx<F, Fut, T>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Context, Querier) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        Cluster::tx(self, ctx, opts, f).await
    }

    async fn primary(&self, _ctx: &Context) -> Result<Querier> {
        Ok(Cluster::primary(self))
    }

    async fn replica(&self, _ctx: &Context) -> Result<Querier> {
        Ok(Cluster::replica(self))
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        Cluster::ping(self, ctx).await
    }

    async fn close(&self) -> Result<()> {
        Cluster::close(self).await
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("connections", &self.inner.connections)
            .field("picker", &self.inner.picker.is_some())
            .finish()
    }
}
