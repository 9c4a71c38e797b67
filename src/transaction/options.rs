use super::TxHandle;
use crate::core::{Error, Result, TxOp};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// Options applied when a transaction (or savepoint) is opened.
///
/// Timeouts are set with `SET LOCAL`, so they last until the enclosing
/// transaction ends. A zero duration leaves the server setting untouched.
/// Isolation level, access mode and deferrability only apply to top-level
/// transactions; a savepoint inherits them from its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub statement_timeout: Duration,
    /// Sets `idle_in_transaction_session_timeout`.
    pub transaction_timeout: Duration,
    pub isolation_level: Option<IsolationLevel>,
    pub access_mode: Option<AccessMode>,
    pub deferrable: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.access_mode = Some(AccessMode::ReadOnly);
        self
    }

    pub fn read_write(mut self) -> Self {
        self.access_mode = Some(AccessMode::ReadWrite);
        self
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    pub(crate) fn begin_statement(&self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation_level {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        match self.access_mode {
            Some(AccessMode::ReadOnly) => sql.push_str(" READ ONLY"),
            Some(AccessMode::ReadWrite) => sql.push_str(" READ WRITE"),
            None => {}
        }
        if self.deferrable {
            sql.push_str(" DEFERRABLE");
        }
        sql
    }

    /// Issues the `SET LOCAL` timeout statements inside `tx`.
    pub(crate) async fn apply(&self, tx: &TxHandle) -> Result<()> {
        if !self.transaction_timeout.is_zero() {
            let sql = format!(
                "SET LOCAL idle_in_transaction_session_timeout = {}",
                self.transaction_timeout.as_millis()
            );
            tx.execute_simple(&sql)
                .await
                .map_err(|e| Error::transaction(TxOp::SetTransactionTimeout, e))?;
        }

        if !self.statement_timeout.is_zero() {
            let sql = format!(
                "SET LOCAL statement_timeout = {}",
                self.statement_timeout.as_millis()
            );
            tx.execute_simple(&sql)
                .await
                .map_err(|e| Error::transaction(TxOp::SetStatementTimeout, e))?;
        }

        Ok(())
    }
}
