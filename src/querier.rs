// ============================================================================
// Query executor
// ============================================================================
//
// A `Querier` runs statements against exactly one target: a pool (every call
// checks out a session for its own duration) or an open transaction.
//
// Resolution order for every call:
//
//   1. the transaction carried by the call's `Context`
//   2. the transaction this querier is bound to
//   3. a fresh session from the bound pool
//
// `tx` follows the same order: with a transaction in scope it opens a
// savepoint, otherwise a new top-level transaction.
//
// ============================================================================

use crate::core::{Error, Result, Value};
use crate::driver::Pool;
use crate::result::{RowSet, ScanApi};
use crate::transaction::{Context, TxHandle, TxOptions};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

#[derive(Clone)]
enum Target {
    Pool(Arc<dyn Pool>),
    Tx(TxHandle),
}

enum Route<'a> {
    Pool(&'a Arc<dyn Pool>),
    Tx(&'a TxHandle),
}

#[derive(Clone)]
pub struct Querier {
    target: Target,
    scan_api: Arc<ScanApi>,
}

impl Querier {
    pub fn from_pool(pool: Arc<dyn Pool>, scan_api: Arc<ScanApi>) -> Self {
        Self {
            target: Target::Pool(pool),
            scan_api,
        }
    }

    pub fn from_tx(tx: TxHandle, scan_api: Arc<ScanApi>) -> Self {
        Self {
            target: Target::Tx(tx),
            scan_api,
        }
    }

    /// The transaction this querier is bound to, if any.
    pub fn tx_handle(&self) -> Option<&TxHandle> {
        match &self.target {
            Target::Tx(tx) => Some(tx),
            Target::Pool(_) => None,
        }
    }

    pub fn scan_api(&self) -> &Arc<ScanApi> {
        &self.scan_api
    }

    pub fn endpoint(&self) -> &str {
        match &self.target {
            Target::Pool(pool) => pool.endpoint(),
            Target::Tx(tx) => tx.endpoint(),
        }
    }

    fn route<'a>(&'a self, ctx: &'a Context) -> Route<'a> {
        if let Some(tx) = ctx.tx() {
            return Route::Tx(tx);
        }
        match &self.target {
            Target::Tx(tx) => Route::Tx(tx),
            Target::Pool(pool) => Route::Pool(pool),
        }
    }

    /// Runs `sql` and buffers every returned row.
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<RowSet> {
        match self.route(ctx) {
            Route::Tx(tx) => tx.query(ctx, sql, params).await,
            Route::Pool(pool) => {
                ctx.run(async {
                    let mut session = pool.acquire().await?;
                    session.query(sql, params).await
                })
                .await
            }
        }
    }

    /// Scans every row into a new vector.
    pub async fn select<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>> {
        let rows = self.query(ctx, sql, params).await?;
        self.scan_api.scan_all(rows)
    }

    /// Scans every row into `dst`, discarding its previous contents.
    ///
    /// `dst` is left untouched when the statement itself fails.
    pub async fn select_into<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        dst: &mut Vec<T>,
        sql: &str,
        params: &[Value],
    ) -> Result<()> {
        let rows = self.query(ctx, sql, params).await?;
        self.scan_api.scan_all_into(dst, rows)
    }

    /// Scans exactly one row. Zero rows is [`Error::NoRows`], more is
    /// [`Error::MultipleRows`].
    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<T> {
        let rows = self.query(ctx, sql, params).await?;
        self.scan_api.scan_one(rows)
    }

    /// Runs `sql` and returns the number of affected rows.
    pub async fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        match self.route(ctx) {
            Route::Tx(tx) => tx.execute(ctx, sql, params).await,
            Route::Pool(pool) => {
                ctx.run(async {
                    let mut session = pool.acquire().await?;
                    session.execute(sql, params).await
                })
                .await
            }
        }
    }

    /// Opens a transaction, or a savepoint when one is already in scope.
    pub async fn begin(&self, ctx: &Context, opts: &TxOptions) -> Result<TxHandle> {
        match self.route(ctx) {
            Route::Tx(tx) => ctx.run(tx.begin_nested(opts)).await,
            Route::Pool(pool) => ctx.run(TxHandle::begin(pool, opts)).await,
        }
    }

    /// Runs `f` inside a transaction.
    ///
    /// `f` receives a copy of `ctx` carrying the new transaction, so helpers
    /// called with it join the transaction. Commits (or releases the savepoint) when `f` succeeds and rolls back
    /// otherwise. When `f` fails and the rollback fails too, the rollback
    /// error is returned. A panic in `f` rolls back and resumes unwinding.
    pub async fn tx<F, Fut, T>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Context, Querier) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.begin(ctx, &opts).await?;
        let inner = Querier::from_tx(handle.clone(), Arc::clone(&self.scan_api));
        let tx_ctx = ctx.with_tx(Some(handle.clone()));

        match AssertUnwindSafe(f(tx_ctx, inner)).catch_unwind().await {
            Ok(Ok(value)) => {
                handle.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => match handle.rollback().await {
                Ok(()) | Err(Error::TxDone) => Err(err),
                Err(rollback_err) => Err(rollback_err),
            },
            Err(panic) => {
                let _ = handle.rollback().await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl std::fmt::Debug for Querier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Querier")
            .field("endpoint", &self.endpoint())
            .field("tx", &self.tx_handle().map(TxHandle::id))
            .finish()
    }
}
