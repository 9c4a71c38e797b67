use std::fmt;
use thiserror::Error;

/// SQLSTATE codes the crate itself inspects or that callers commonly match on.
pub mod codes {
    /// `query_canceled`, raised when `statement_timeout` fires.
    pub const QUERY_CANCELED: &str = "57014";
    /// `idle_in_transaction_session_timeout`, raised when a transaction stays idle too long.
    pub const IDLE_IN_TRANSACTION_SESSION_TIMEOUT: &str = "25P03";
    /// `in_failed_sql_transaction`
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
    /// `no_active_sql_transaction`
    pub const NO_ACTIVE_SQL_TRANSACTION: &str = "25P01";
    /// `read_only_sql_transaction`
    pub const READ_ONLY_SQL_TRANSACTION: &str = "25006";
    /// `invalid_savepoint_specification`
    pub const INVALID_SAVEPOINT_SPECIFICATION: &str = "3B001";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const INVALID_PARAMETER_VALUE: &str = "22023";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const UNDEFINED_OBJECT: &str = "42704";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const UNABLE_TO_CONNECT: &str = "08001";
}

/// Transaction primitive that failed, carried by [`Error::Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Begin,
    Commit,
    Rollback,
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
    SetStatementTimeout,
    SetTransactionTimeout,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Begin => "begin transaction",
            Self::Commit => "commit transaction",
            Self::Rollback => "rollback transaction",
            Self::Savepoint => "create savepoint",
            Self::ReleaseSavepoint => "release savepoint",
            Self::RollbackToSavepoint => "rollback to savepoint",
            Self::SetStatementTimeout => "set statement timeout",
            Self::SetTransactionTimeout => "set transaction timeout",
        };
        f.write_str(op)
    }
}

/// Failure reported by the database driver, verbatim.
///
/// `code` is the SQLSTATE sent by the server, when there was one.
#[derive(Debug)]
pub struct DriverError {
    code: Option<String>,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(message).with_sqlstate(Some(code.into()))
    }

    pub fn with_sqlstate(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to parse config at index {index}: {message}")]
    Config { index: usize, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cluster requires at least one connection")]
    EmptyCluster,

    #[error(transparent)]
    Aggregate(#[from] MultiError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("closed pool")]
    Closed,

    #[error("no rows in result set")]
    NoRows,

    #[error("expected one row, got {0}")]
    MultipleRows(usize),

    #[error("scan: {0}")]
    Scan(String),

    #[error("{op}: {source}")]
    Transaction {
        op: TxOp,
        #[source]
        source: Box<Error>,
    },

    #[error("transaction was aborted by a failed statement and has been rolled back")]
    TxAborted,

    #[error("transaction already committed or rolled back")]
    TxDone,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context canceled")]
    Cancelled,

    #[error("lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn transaction(op: TxOp, source: Error) -> Self {
        Self::Transaction {
            op,
            source: Box::new(source),
        }
    }

    /// SQLSTATE of the underlying driver failure, looking through transaction wrappers.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Driver(err) => err.code(),
            Self::Transaction { source, .. } => source.code(),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Transaction { source, .. } => source.is_closed(),
            _ => false,
        }
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::NoRows)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

/// Every failure collected from a fan-out over several connections.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error, flattening nested aggregates.
    pub fn push(&mut self, err: Error) {
        match err {
            Error::Aggregate(nested) => self.errors.extend(nested.errors),
            other => self.errors.push(other),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            writeln!(f, "1 error occurred:")?;
        } else {
            writeln!(f, "{} errors occurred:", self.errors.len())?;
        }
        for err in &self.errors {
            writeln!(f, "\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl FromIterator<Error> for MultiError {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
        let mut multi = Self::new();
        for err in iter {
            multi.push(err);
        }
        multi
    }
}

impl IntoIterator for MultiError {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a MultiError {
    type Item = &'a Error;
    type IntoIter = std::slice::Iter<'a, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}
