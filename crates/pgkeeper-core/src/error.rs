//! Error types.
//!
//! `DbError` is what a connection backend reports; `Error` is what the public
//! operations of this crate return, usually a `DbError` wrapped with the name
//! of the operation that failed.

use thiserror::Error;

/// SQLSTATE `serialization_failure`.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE `deadlock_detected`.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// Error reported by a database backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DbError {
    /// Could not establish or keep a connection.
    #[error("PostgreSQL: {0}")]
    Connection(String),

    /// The server rejected a statement.
    #[error("{message}")]
    Query {
        /// Five-character SQLSTATE, when the server sent one.
        code: Option<String>,
        message: String,
    },

    /// A result column was requested that the row does not have.
    #[error("column {0} not found")]
    ColumnNotFound(String),

    /// A result value could not be converted to the requested type.
    #[error("column {column}: {message}")]
    Decode { column: String, message: String },
}

impl DbError {
    /// Builds a query error without SQLSTATE.
    pub fn query(message: impl Into<String>) -> Self {
        DbError::Query {
            code: None,
            message: message.into(),
        }
    }

    /// Builds a query error carrying a SQLSTATE code.
    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        DbError::Query {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// Returns the SQLSTATE code, if known.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            DbError::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn from_postgres(e: &postgres::Error) -> Self {
        let message = crate::db::pg::format_postgres_error(e);
        if let Some(state) = e.code() {
            DbError::Query {
                code: Some(state.code().to_string()),
                message,
            }
        } else if e.is_closed() {
            DbError::Connection(message)
        } else {
            DbError::Query {
                code: None,
                message,
            }
        }
    }
}

impl From<postgres::Error> for DbError {
    fn from(e: postgres::Error) -> Self {
        DbError::from_postgres(&e)
    }
}

/// Error returned by pgkeeper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// EXPLAIN ANALYZE failed because the analysed query failed.
    #[error("plan execution error: {0}")]
    PlanExecution(#[source] DbError),

    /// EXPLAIN returned no rows.
    #[error("empty result from EXPLAIN")]
    EmptyPlan,

    /// EXPLAIN output did not match the expected JSON shape.
    #[error("failed to parse plan: {0}")]
    PlanParse(String),

    /// A table, column or schema name failed validation.
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A database call failed while performing `operation`.
    #[error("{operation}: {source}")]
    Db {
        operation: String,
        #[source]
        source: DbError,
    },

    /// A retryable error persisted after every retry.
    #[error("transaction failed after {retries} retries: {source}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        source: Box<Error>,
    },

    /// A background thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Batch migration stopped part-way through.
    #[error("migration {source_table} -> {target_table} stopped after {migrated} rows: {source}")]
    Migration {
        source_table: String,
        target_table: String,
        migrated: i64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the underlying driver error, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Error::PlanExecution(e) => Some(e),
            Error::Db { source, .. } => Some(source),
            Error::RetriesExhausted { source, .. } | Error::Migration { source, .. } => {
                source.db_error()
            }
            _ => None,
        }
    }

    /// Returns the SQLSTATE code of the underlying driver error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        self.db_error().and_then(DbError::sqlstate)
    }
}

impl From<DbError> for Error {
    fn from(source: DbError) -> Self {
        Error::Db {
            operation: "query".to_string(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches an operation name to driver errors.
pub trait DbResultExt<T> {
    fn during(self, operation: impl Into<String>) -> Result<T>;
}

impl<T> DbResultExt<T> for std::result::Result<T, DbError> {
    fn during(self, operation: impl Into<String>) -> Result<T> {
        self.map_err(|source| Error::Db {
            operation: operation.into(),
            source,
        })
    }
}
