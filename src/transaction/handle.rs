// ============================================================================
// Active transaction handle
// ============================================================================
//
// A top-level handle owns one session checked out of a pool for its whole
// lifetime. Nested handles share that session and map onto savepoints.
//
// Postgres refuses every statement after a failure until the block is
// rolled back. The session tracks that condition so committing such a
// transaction reports `TxAborted` instead of a silent rollback.
//
// ============================================================================

use super::{Context, TransactionId, TransactionState, TxOptions};
use crate::core::{Error, Result, TxOp, Value};
use crate::driver::{Pool, Session};
use crate::result::RowSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

struct SharedSession {
    conn: tokio::sync::Mutex<Box<dyn Session>>,
    endpoint: String,
    aborted: AtomicBool,
    ended: AtomicBool,
    savepoint_seq: AtomicU64,
}

struct TxInner {
    id: TransactionId,
    depth: usize,
    savepoint: Option<String>,
    session: Arc<SharedSession>,
    state: Mutex<TransactionState>,
}

/// An open transaction, or a savepoint within one.
///
/// Clones refer to the same transaction.
#[derive(Clone)]
pub struct TxHandle {
    inner: Arc<TxInner>,
}

impl TxHandle {
    /// Checks a session out of `pool`, begins a transaction on it and applies `opts`.
    pub async fn begin(pool: &Arc<dyn Pool>, opts: &TxOptions) -> Result<Self> {
        let mut session = pool
            .acquire()
            .await
            .map_err(|e| Error::transaction(TxOp::Begin, e))?;
        session
            .begin(&opts.begin_statement())
            .await
            .map_err(|e| Error::transaction(TxOp::Begin, e))?;

        let handle = Self {
            inner: Arc::new(TxInner {
                id: TransactionId::new(),
                depth: 0,
                savepoint: None,
                session: Arc::new(SharedSession {
                    conn: tokio::sync::Mutex::new(session),
                    endpoint: pool.endpoint().to_string(),
                    aborted: AtomicBool::new(false),
                    ended: AtomicBool::new(false),
                    savepoint_seq: AtomicU64::new(0),
                }),
                state: Mutex::new(TransactionState::Active),
            }),
        };
        debug!(tx = %handle.id(), endpoint = %handle.endpoint(), "transaction begun");

        handle.apply_or_rollback(opts).await?;
        Ok(handle)
    }

    /// Opens a savepoint inside this transaction.
    pub async fn begin_nested(&self, opts: &TxOptions) -> Result<Self> {
        self.ensure_active()?;
        let seq = self.inner.session.savepoint_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("pgcluster_sp_{}", seq);

        self.inner
            .session
            .conn
            .lock()
            .await
            .savepoint(&name)
            .await
            .map_err(|e| Error::transaction(TxOp::Savepoint, e))?;

        let handle = Self {
            inner: Arc::new(TxInner {
                id: TransactionId::new(),
                depth: self.inner.depth + 1,
                savepoint: Some(name),
                session: Arc::clone(&self.inner.session),
                state: Mutex::new(TransactionState::Active),
            }),
        };
        trace!(tx = %handle.id(), parent = %self.id(), depth = handle.depth(), "savepoint created");

        handle.apply_or_rollback(opts).await?;
        Ok(handle)
    }

    async fn apply_or_rollback(&self, opts: &TxOptions) -> Result<()> {
        if let Err(err) = opts.apply(self).await {
            // The apply failure is more useful than a rollback failure here.
            let _ = self.rollback().await;
            return Err(err);
        }
        Ok(())
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// 0 for a top-level transaction, n for the n-th nested savepoint.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn is_nested(&self) -> bool {
        self.inner.savepoint.is_some()
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.inner.savepoint.as_deref()
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.session.endpoint
    }

    pub fn state(&self) -> Result<TransactionState> {
        Ok(*self.inner.state.lock()?)
    }

    /// True once a statement failed and the block has not been rolled back since.
    pub fn is_aborted(&self) -> bool {
        self.inner.session.aborted.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.ensure_active().is_ok()
    }

    /// True when both handles run on the same physical session, i.e. one is
    /// the other or a savepoint inside it.
    pub fn shares_session(&self, other: &TxHandle) -> bool {
        Arc::ptr_eq(&self.inner.session, &other.inner.session)
    }

    pub(crate) fn mark_aborted(&self) {
        self.inner.session.aborted.store(true, Ordering::SeqCst);
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.session.ended.load(Ordering::SeqCst) || !self.state()?.is_active() {
            return Err(Error::TxDone);
        }
        Ok(())
    }

    fn finish(&self, next: TransactionState) -> Result<()> {
        if self.inner.session.ended.load(Ordering::SeqCst) {
            return Err(Error::TxDone);
        }
        let mut state = self.inner.state.lock()?;
        if state.is_finished() {
            return Err(Error::TxDone);
        }
        *state = next;
        Ok(())
    }

    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.ensure_active()?;
        let result = ctx
            .run(async {
                let mut conn = self.inner.session.conn.lock().await;
                conn.query(sql, params).await
            })
            .await;
        if result.is_err() {
            self.mark_aborted();
        }
        result
    }

    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_active()?;
        let result = ctx
            .run(async {
                let mut conn = self.inner.session.conn.lock().await;
                conn.execute(sql, params).await
            })
            .await;
        if result.is_err() {
            self.mark_aborted();
        }
        result
    }

    pub(crate) async fn execute_simple(&self, sql: &str) -> Result<()> {
        self.ensure_active()?;
        let result = self.inner.session.conn.lock().await.execute_simple(sql).await;
        if result.is_err() {
            self.mark_aborted();
        }
        result
    }

    /// Commits the transaction, or releases the savepoint.
    ///
    /// If a statement failed since the last rollback point, the block is
    /// rolled back instead and `TxAborted` is returned.
    pub async fn commit(&self) -> Result<()> {
        if self.is_aborted() {
            self.rollback().await?;
            return Err(Error::TxAborted);
        }
        self.finish(TransactionState::Committed)?;

        let mut conn = self.inner.session.conn.lock().await;
        match &self.inner.savepoint {
            None => {
                let result = conn.commit().await;
                self.inner.session.ended.store(true, Ordering::SeqCst);
                debug!(tx = %self.id(), ok = result.is_ok(), "transaction committed");
                result.map_err(|e| Error::transaction(TxOp::Commit, e))
            }
            Some(name) => {
                trace!(tx = %self.id(), savepoint = %name, "savepoint released");
                conn.release_savepoint(name)
                    .await
                    .map_err(|e| Error::transaction(TxOp::ReleaseSavepoint, e))
            }
        }
    }

    /// Rolls the transaction back, or rolls back to the savepoint.
    pub async fn rollback(&self) -> Result<()> {
        self.finish(TransactionState::RolledBack)?;

        let mut conn = self.inner.session.conn.lock().await;
        match &self.inner.savepoint {
            None => {
                let result = conn.rollback().await;
                self.inner.session.ended.store(true, Ordering::SeqCst);
                self.inner.session.aborted.store(false, Ordering::SeqCst);
                debug!(tx = %self.id(), ok = result.is_ok(), "transaction rolled back");
                result.map_err(|e| Error::transaction(TxOp::Rollback, e))
            }
            Some(name) => {
                conn.rollback_to_savepoint(name)
                    .await
                    .map_err(|e| Error::transaction(TxOp::RollbackToSavepoint, e))?;
                self.inner.session.aborted.store(false, Ordering::SeqCst);
                trace!(tx = %self.id(), savepoint = %name, "rolled back to savepoint");
                Ok(())
            }
        }
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        let unfinished = self
            .state
            .get_mut()
            .map(|state| state.is_active())
            .unwrap_or(false);
        if self.savepoint.is_some() || !unfinished || self.session.ended.load(Ordering::SeqCst) {
            return;
        }

        debug!(tx = %self.id, "rolling back abandoned transaction");
        let session = Arc::clone(&self.session);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = session.conn.lock().await.rollback().await;
                session.ended.store(true, Ordering::SeqCst);
            });
        }
    }
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.inner.id)
            .field("depth", &self.inner.depth)
            .field("savepoint", &self.inner.savepoint)
            .field("endpoint", &self.inner.session.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryServer;
    use crate::core::codes;

    fn pool(server: &MemoryServer) -> Arc<dyn Pool> {
        Arc::new(server.pool())
    }

    #[tokio::test]
    async fn test_single_transition() {
        let server = MemoryServer::new("db");
        let tx = TxHandle::begin(&pool(&server), &TxOptions::new()).await.unwrap();

        tx.commit().await.unwrap();
        assert_eq!(tx.state().unwrap(), TransactionState::Committed);
        assert!(matches!(tx.commit().await, Err(Error::TxDone)));
        assert!(matches!(tx.rollback().await, Err(Error::TxDone)));
        assert!(matches!(
            tx.query(&Context::background(), "SELECT 1", &[]).await,
            Err(Error::TxDone)
        ));
    }

    #[tokio::test]
    async fn test_commit_after_failed_statement_reports_aborted() {
        let server = MemoryServer::new("db");
        let ctx = Context::background();
        let tx = TxHandle::begin(&pool(&server), &TxOptions::new()).await.unwrap();

        let err = tx.query(&ctx, "SELECT * FROM missing", &[]).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::UNDEFINED_TABLE));
        assert!(tx.is_aborted());

        assert!(matches!(tx.commit().await, Err(Error::TxAborted)));
        assert_eq!(tx.state().unwrap(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_clears_abort() {
        let server = MemoryServer::new("db");
        let ctx = Context::background();
        let tx = TxHandle::begin(&pool(&server), &TxOptions::new()).await.unwrap();
        tx.execute(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();

        let nested = tx.begin_nested(&TxOptions::new()).await.unwrap();
        assert_eq!(nested.depth(), 1);
        assert_eq!(nested.savepoint_name(), Some("pgcluster_sp_1"));
        assert!(nested.execute(&ctx, "INSERT INTO nope VALUES (1)", &[]).await.is_err());
        nested.rollback().await.unwrap();

        assert!(!tx.is_aborted());
        tx.execute(&ctx, "INSERT INTO t VALUES (1)", &[]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(server.row_count("t").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_nested_handle_is_done_after_parent_ends() {
        let server = MemoryServer::new("db");
        let tx = TxHandle::begin(&pool(&server), &TxOptions::new()).await.unwrap();
        let nested = tx.begin_nested(&TxOptions::new()).await.unwrap();

        tx.rollback().await.unwrap();
        assert!(!nested.is_active());
        assert!(matches!(nested.commit().await, Err(Error::TxDone)));
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() {
        let server = MemoryServer::new("db");
        let ctx = Context::background();
        let pool = pool(&server);
        {
            let tx = TxHandle::begin(&pool, &TxOptions::new()).await.unwrap();
            tx.execute(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(server.row_count("t").unwrap(), None);
    }
}
