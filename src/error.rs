use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("filter type error: {0}")]
    FilterType(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },
    #[error("embedder error: {message}")]
    Embedder { message: String, retryable: bool },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("consistency violation: {detail} (run `{hint}`)")]
    Consistency { detail: String, hint: Remedy },
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn embedder(message: impl Into<String>) -> Self {
        Error::Embedder {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Embedder { retryable, .. } => *retryable,
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            Error::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Remediation hint carried by consistency errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    Compact,
    Reconcile,
}

impl fmt::Display for Remedy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remedy::Compact => f.write_str("compact"),
            Remedy::Reconcile => f.write_str("reconcile"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },
    #[error("{table}.{column} is not a vector column")]
    NotVectorColumn { table: String, column: String },
    #[error("table {table} has no {kind} column")]
    MissingColumnKind { table: String, kind: &'static str },
    #[error("table {table} has multiple {kind} columns; name one explicitly")]
    AmbiguousColumnKind { table: String, kind: &'static str },
    #[error("dimension mismatch for {table}.{column}: expected {expected}, got {got}")]
    DimensionMismatch {
        table: String,
        column: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid table {table}: {reason}")]
    InvalidTable { table: String, reason: String },
    #[error("view {0} is not writable")]
    ViewNotWritable(String),
    #[error("stored schema does not match: {0}")]
    FingerprintMismatch(String),
    #[error(transparent)]
    View(#[from] ViewError),
}

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("view {view}: unknown table {table}")]
    UnknownTable { view: String, table: String },
    #[error("view {view}: unknown field {table}.{column}")]
    UnknownField {
        view: String,
        table: String,
        column: String,
    },
    #[error("view {view}: tables are not connected by foreign keys")]
    DisconnectedJoin { view: String },
    #[error("view {view}: no `id` alias onto a vector-bearing table's primary key")]
    MissingVectorId { view: String },
}
