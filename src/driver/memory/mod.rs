// ============================================================================
// In-process database engine
// ============================================================================
//
// A `MemoryServer` behaves like one Postgres endpoint for the purposes of
// the cluster layer: it has a database name, can be taken offline, and its
// sessions honour transactions, savepoints, `SET LOCAL` timeouts and the
// SQLSTATE codes the real server reports (57014, 25P03, 25P02, ...).
//
// Transactions work on a private copy of the tables taken at BEGIN. COMMIT
// writes back every table the transaction touched.
//
// ============================================================================

mod engine;
mod settings;
mod sql;

use self::engine::{EvalContext, Outcome, Tables, driver_error};
use self::settings::{SessionView, Settings};
use self::sql::{Expr, Projection, Statement, TxModes};
use super::{Connect, Pool, Session};
use crate::core::{DriverError, Error, Result, Value, codes};
use crate::result::RowSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Counters a test can assert on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Sessions handed out by every pool of this server.
    pub connections: u64,
    pub statements: u64,
    /// Top-level transactions begun.
    pub transactions: u64,
}

struct ServerInner {
    name: String,
    available: AtomicBool,
    tables: Mutex<Tables>,
    connections: AtomicU64,
    statements: AtomicU64,
    transactions: AtomicU64,
}

/// One simulated database endpoint. Clones share the same data.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    /// Creates an empty server; `name` is what `current_database()` returns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                available: AtomicBool::new(true),
                tables: Mutex::new(Tables::new()),
                connections: AtomicU64::new(0),
                statements: AtomicU64::new(0),
                transactions: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Takes the server offline or back online. Offline servers refuse new
    /// connections and fail every statement of existing sessions.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.inner.connections.load(Ordering::SeqCst),
            statements: self.inner.statements.load(Ordering::SeqCst),
            transactions: self.inner.transactions.load(Ordering::SeqCst),
        }
    }

    /// Committed row count of `table`, bypassing every session.
    pub fn row_count(&self, table: &str) -> Result<Option<usize>> {
        let tables = self.inner.tables.lock()?;
        Ok(tables.get(&table.to_lowercase()).map(|t| t.len()))
    }

    /// Opens a pool without going through [`Connect`].
    pub fn pool(&self) -> MemoryPool {
        MemoryPool {
            server: self.clone(),
            endpoint: self.endpoint_name(),
            closed: AtomicBool::new(false),
        }
    }

    fn endpoint_name(&self) -> String {
        format!("memory://{}", self.inner.name)
    }

    fn refuse(&self) -> Error {
        Error::Driver(DriverError::with_code(
            codes::UNABLE_TO_CONNECT,
            format!("failed to connect to `{}`: connection refused", self.endpoint_name()),
        ))
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("name", &self.inner.name)
            .field("available", &self.is_available())
            .finish()
    }
}

#[async_trait]
impl Connect for MemoryServer {
    async fn connect(&self) -> Result<Arc<dyn Pool>> {
        if !self.is_available() {
            return Err(self.refuse());
        }
        Ok(Arc::new(self.pool()))
    }

    fn endpoint(&self) -> String {
        self.endpoint_name()
    }
}

pub struct MemoryPool {
    server: MemoryServer,
    endpoint: String,
    closed: AtomicBool,
}

impl MemoryPool {
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }

    pub async fn session(&self) -> Result<MemorySession> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.server.is_available() {
            return Err(self.server.refuse());
        }
        self.server.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession::new(self.server.clone()))
    }
}

#[async_trait]
impl Pool for MemoryPool {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn acquire(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(self.session().await?))
    }

    async fn ping(&self) -> Result<()> {
        let mut session = self.session().await?;
        session.run("SELECT 1", &[]).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct SavepointState {
    name: String,
    tables: Tables,
    dirty: BTreeSet<String>,
    settings: Settings,
}

struct TxState {
    tables: Tables,
    dirty: BTreeSet<String>,
    settings: Settings,
    savepoints: Vec<SavepointState>,
    aborted: bool,
    modes: TxModes,
    started_at: DateTime<Utc>,
}

/// One session on a [`MemoryServer`].
pub struct MemorySession {
    server: MemoryServer,
    settings: Settings,
    tx: Option<TxState>,
    last_activity: Instant,
    /// Set once the server terminated the session.
    broken: bool,
}

impl MemorySession {
    fn new(server: MemoryServer) -> Self {
        Self {
            server,
            settings: Settings::default(),
            tx: None,
            last_activity: Instant::now(),
            broken: false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<Outcome> {
        if self.broken {
            return Err(Error::Driver(DriverError::with_code(
                codes::CONNECTION_FAILURE,
                "conn closed",
            )));
        }
        if !self.server.is_available() {
            self.broken = true;
            self.tx = None;
            return Err(driver_error(
                codes::CONNECTION_FAILURE,
                "terminating connection due to administrator command",
            ));
        }
        self.server.inner.statements.fetch_add(1, Ordering::SeqCst);
        trace!(server = %self.server.name(), sql, "memory statement");

        if let Some(tx) = &self.tx {
            let idle = tx.settings.idle_timeout();
            if !idle.is_zero() && self.last_activity.elapsed() > idle {
                self.broken = true;
                self.tx = None;
                return Err(driver_error(
                    codes::IDLE_IN_TRANSACTION_SESSION_TIMEOUT,
                    "terminating connection due to idle-in-transaction timeout",
                ));
            }
        }

        let result = match sql::parse(sql) {
            Ok(stmt) => self.dispatch(stmt, params).await,
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Some(tx) = self.tx.as_mut() {
                tx.aborted = true;
            }
        }
        self.last_activity = Instant::now();
        result
    }

    fn view(&self) -> SessionView {
        let database = self.server.name().to_string();
        match &self.tx {
            Some(tx) => SessionView {
                database,
                now: tx.started_at,
                settings: tx.settings.clone(),
                isolation: tx.modes.isolation.clone(),
                read_only: tx.modes.read_only,
            },
            None => SessionView {
                database,
                now: Utc::now(),
                settings: self.settings.clone(),
                isolation: None,
                read_only: false,
            },
        }
    }

    async fn dispatch(&mut self, stmt: Statement, params: &[Value]) -> Result<Outcome> {
        if let Some(tx) = &self.tx {
            if tx.aborted && !stmt.ends_block() {
                return Err(driver_error(
                    codes::IN_FAILED_SQL_TRANSACTION,
                    "current transaction is aborted, commands ignored until end of transaction block",
                ));
            }
            if tx.modes.read_only {
                if let Some(tag) = stmt.write_tag() {
                    return Err(driver_error(
                        codes::READ_ONLY_SQL_TRANSACTION,
                        format!("cannot execute {} in a read-only transaction", tag),
                    ));
                }
            }
        }

        match stmt {
            Statement::Begin(modes) => {
                self.begin(modes)?;
                Ok(Outcome::empty())
            }
            Statement::Commit => {
                self.commit()?;
                Ok(Outcome::empty())
            }
            Statement::Rollback => {
                self.tx = None;
                Ok(Outcome::empty())
            }
            Statement::Savepoint(name) => {
                let tx = self.tx_mut("SAVEPOINT")?;
                let state = SavepointState {
                    name,
                    tables: tx.tables.clone(),
                    dirty: tx.dirty.clone(),
                    settings: tx.settings.clone(),
                };
                tx.savepoints.push(state);
                Ok(Outcome::empty())
            }
            Statement::Release(name) => {
                let tx = self.tx_mut("RELEASE SAVEPOINT")?;
                let pos = find_savepoint(tx, &name)?;
                tx.savepoints.truncate(pos);
                Ok(Outcome::empty())
            }
            Statement::RollbackTo(name) => {
                let tx = self.tx_mut("ROLLBACK TO SAVEPOINT")?;
                let pos = find_savepoint(tx, &name)?;
                let (tables, dirty, settings) = {
                    let sp = &tx.savepoints[pos];
                    (sp.tables.clone(), sp.dirty.clone(), sp.settings.clone())
                };
                tx.tables = tables;
                tx.dirty = dirty;
                tx.settings = settings;
                tx.savepoints.truncate(pos + 1);
                tx.aborted = false;
                Ok(Outcome::empty())
            }
            Statement::Set { local, name, value } => {
                if !local {
                    self.settings.set(&name, &value)?;
                }
                // SET LOCAL outside a transaction block has no effect.
                if let Some(tx) = self.tx.as_mut() {
                    tx.settings.set(&name, &value)?;
                }
                Ok(Outcome::empty())
            }
            Statement::Show(name) => {
                let value = self.view().show(&name)?;
                Ok(Outcome::rows(RowSet::new(
                    vec![name],
                    vec![vec![Value::Text(value)]],
                )))
            }
            Statement::Select {
                items,
                from: None,
                limit,
                ..
            } => self.select_values(items, limit, params).await,
            other => {
                let view = self.view();
                let ctx = EvalContext {
                    params,
                    view: &view,
                    allow_sleep: false,
                };
                self.with_tables(|tables, dirty| engine::execute(tables, dirty, other, &ctx))
            }
        }
    }

    fn tx_mut(&mut self, command: &str) -> Result<&mut TxState> {
        self.tx.as_mut().ok_or_else(|| {
            driver_error(
                codes::NO_ACTIVE_SQL_TRANSACTION,
                format!("{} can only be used in transaction blocks", command),
            )
        })
    }

    fn begin(&mut self, modes: TxModes) -> Result<()> {
        // BEGIN inside a transaction block only warns.
        if self.tx.is_some() {
            return Ok(());
        }
        let tables = self.server.inner.tables.lock()?.clone();
        self.server.inner.transactions.fetch_add(1, Ordering::SeqCst);
        self.tx = Some(TxState {
            tables,
            dirty: BTreeSet::new(),
            settings: self.settings.clone(),
            savepoints: Vec::new(),
            aborted: false,
            modes,
            started_at: Utc::now(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        // COMMIT of a failed block reports ROLLBACK and discards the work.
        if tx.aborted {
            return Ok(());
        }

        let TxState {
            tables: mut working,
            dirty,
            ..
        } = tx;
        let mut tables = self.server.inner.tables.lock()?;
        for name in dirty {
            match working.remove(&name) {
                Some(table) => {
                    tables.insert(name, table);
                }
                None => {
                    tables.remove(&name);
                }
            }
        }
        Ok(())
    }

    /// Runs `f` against the transaction's tables, or atomically against the
    /// committed tables when no transaction is open.
    fn with_tables<R>(
        &mut self,
        f: impl FnOnce(&mut Tables, &mut BTreeSet<String>) -> Result<R>,
    ) -> Result<R> {
        if let Some(tx) = self.tx.as_mut() {
            return f(&mut tx.tables, &mut tx.dirty);
        }

        let mut tables = self.server.inner.tables.lock()?;
        let mut working = tables.clone();
        let mut dirty = BTreeSet::new();
        let out = f(&mut working, &mut dirty)?;
        for name in dirty {
            match working.remove(&name) {
                Some(table) => {
                    tables.insert(name, table);
                }
                None => {
                    tables.remove(&name);
                }
            }
        }
        Ok(out)
    }

    async fn select_values(
        &mut self,
        items: Vec<Projection>,
        limit: Option<usize>,
        params: &[Value],
    ) -> Result<Outcome> {
        let view = self.view();
        let ctx = EvalContext {
            params,
            view: &view,
            allow_sleep: true,
        };

        for item in &items {
            if let Projection::Expr { expr, .. } = item {
                if let Some(arg) = sleep_argument(expr) {
                    pg_sleep(arg, &ctx).await?;
                }
            }
        }

        engine::project_values(&items, &ctx, limit)
    }
}

fn find_savepoint(tx: &TxState, name: &str) -> Result<usize> {
    tx.savepoints
        .iter()
        .rposition(|sp| sp.name == name)
        .ok_or_else(|| {
            driver_error(
                codes::INVALID_SAVEPOINT_SPECIFICATION,
                format!("savepoint \"{}\" does not exist", name),
            )
        })
}

fn sleep_argument(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Sleep(arg) => Some(arg.as_ref()),
        Expr::Cast(inner, _) => sleep_argument(inner),
        _ => None,
    }
}

/// Sleeps like `pg_sleep`, cut short by the effective `statement_timeout`.
async fn pg_sleep(arg: &Expr, ctx: &EvalContext<'_>) -> Result<()> {
    let seconds = engine::eval(arg, ctx, None)?
        .as_f64()
        .ok_or_else(|| driver_error(codes::INVALID_TEXT_REPRESENTATION, "pg_sleep expects a number"))?;
    let wanted = Duration::from_secs_f64(seconds.clamp(0.0, 86_400.0));
    let limit = ctx.view.settings.statement_timeout();

    if !limit.is_zero() && wanted > limit {
        tokio::time::sleep(limit).await;
        return Err(driver_error(
            codes::QUERY_CANCELED,
            "canceling statement due to statement timeout",
        ));
    }
    tokio::time::sleep(wanted).await;
    Ok(())
}

#[async_trait]
impl Session for MemorySession {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        Ok(self.run(sql, params).await?.rows)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(self.run(sql, params).await?.affected)
    }

    async fn execute_simple(&mut self, sql: &str) -> Result<()> {
        self.run(sql, &[]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(server: &MemoryServer) -> MemorySession {
        server.pool().session().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_publishes_rollback_discards() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;
        s.execute_simple("CREATE TABLE t (id INT)").await.unwrap();

        Session::begin(&mut s, "BEGIN").await.unwrap();
        s.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        assert_eq!(server.row_count("t").unwrap(), Some(0));
        Session::commit(&mut s).await.unwrap();
        assert_eq!(server.row_count("t").unwrap(), Some(1));

        Session::begin(&mut s, "BEGIN").await.unwrap();
        s.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        s.rollback().await.unwrap();
        assert_eq!(server.row_count("t").unwrap(), Some(1));
        assert_eq!(server.stats().transactions, 2);
    }

    #[tokio::test]
    async fn test_savepoint_restores_state() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;
        s.execute_simple("CREATE TABLE t (id INT)").await.unwrap();

        Session::begin(&mut s, "BEGIN").await.unwrap();
        s.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        s.savepoint("sp_1").await.unwrap();
        s.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        s.rollback_to_savepoint("sp_1").await.unwrap();
        s.release_savepoint("sp_1").await.unwrap();

        let rows = s.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.row_count(), 1);
        Session::commit(&mut s).await.unwrap();
        assert_eq!(server.row_count("t").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_failed_statement_aborts_block() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;

        Session::begin(&mut s, "BEGIN").await.unwrap();
        assert!(s.query("SELECT * FROM missing", &[]).await.is_err());
        let err = s.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::IN_FAILED_SQL_TRANSACTION));
        s.rollback().await.unwrap();
        assert!(s.query("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_statement_timeout_cancels_sleep() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;
        Session::begin(&mut s, "BEGIN").await.unwrap();
        s.execute_simple("SET LOCAL statement_timeout = 20").await.unwrap();

        let start = Instant::now();
        let err = s.execute("SELECT pg_sleep(1)", &[]).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::QUERY_CANCELED));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_idle_timeout_terminates_session() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;
        Session::begin(&mut s, "BEGIN").await.unwrap();
        s.execute_simple("SET LOCAL idle_in_transaction_session_timeout = 10")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let err = Session::commit(&mut s).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::IDLE_IN_TRANSACTION_SESSION_TIMEOUT));
        assert!(s.query("SELECT 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_set_local_is_scoped_to_transaction() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;
        Session::begin(&mut s, "BEGIN").await.unwrap();
        s.execute_simple("SET LOCAL statement_timeout = 2000").await.unwrap();
        let rows = s.query("SHOW statement_timeout", &[]).await.unwrap();
        assert_eq!(rows.value(0, "statement_timeout"), Some(&Value::from("2s")));
        Session::commit(&mut s).await.unwrap();

        let rows = s.query("SELECT current_setting('statement_timeout') AS t", &[]).await.unwrap();
        assert_eq!(rows.value(0, "t"), Some(&Value::from("0")));
    }

    #[tokio::test]
    async fn test_read_only_transaction() {
        let server = MemoryServer::new("db");
        let mut s = session(&server).await;
        s.execute_simple("CREATE TABLE t (id INT)").await.unwrap();
        Session::begin(&mut s, "BEGIN READ ONLY").await.unwrap();
        let err = s.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::READ_ONLY_SQL_TRANSACTION));
    }

    #[tokio::test]
    async fn test_closed_pool_and_offline_server() {
        let server = MemoryServer::new("db");
        let pool = server.pool();
        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::Closed)));

        server.set_available(false);
        let err = server.connect().await.err().unwrap();
        assert_eq!(err.code(), Some(codes::UNABLE_TO_CONNECT));
    }
}
