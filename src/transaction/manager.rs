// ============================================================================
// Transaction Manager
// ============================================================================
//
// Explicit begin/commit/rollback for callers that cannot express their unit
// of work as a single closure. `begin` hands back a child context carrying
// the new transaction, so every call made with it joins the transaction.
//
// ============================================================================

use super::{Context, TxHandle, TxOptions};
use crate::core::Result;
use crate::querier::Querier;

pub struct TxManager {
    querier: Querier,
}

impl TxManager {
    pub fn new(querier: Querier) -> Self {
        Self { querier }
    }

    /// Begins a transaction, or a savepoint when `ctx` already carries one.
    pub async fn begin(&self, ctx: &Context, opts: TxOptions) -> Result<(Context, TxGuard)> {
        let handle = self.querier.begin(ctx, &opts).await?;
        let child = ctx.with_tx(Some(handle.clone()));
        Ok((child, TxGuard { handle }))
    }
}

/// Explicit end of a transaction opened by [`TxManager::begin`].
///
/// A top-level transaction whose guard and contexts are all dropped without
/// `commit` is rolled back in the background.
#[must_use = "a transaction guard must be committed or rolled back"]
pub struct TxGuard {
    handle: TxHandle,
}

impl TxGuard {
    pub fn handle(&self) -> &TxHandle {
        &self.handle
    }

    pub async fn commit(self) -> Result<()> {
        self.handle.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.handle.rollback().await
    }
}
