//! Connection abstraction.
//!
//! Every pgkeeper operation talks to the engine through [`Executor`]; the ones
//! that need a transaction take a [`Database`]. Rows come back as owned
//! [`Row`]s of [`Value`]s so the same code runs against [`PgDatabase`] and
//! against the scripted [`mock::MockDatabase`].
//!
//! ```
//! use pgkeeper_core::db::{Executor, Value};
//! use pgkeeper_core::db::mock::MockDatabase;
//!
//! let mut db = MockDatabase::new();
//! db.on_execute("DELETE FROM events", 3);
//! let n = db.execute("DELETE FROM events WHERE id < $1", &[Value::from(10)]).unwrap();
//! assert_eq!(n, 3);
//! ```

pub mod mock;
pub(crate) mod pg;
mod pg_types;
mod value;

pub use pg::{PgDatabase, PgTransaction};
pub use value::{FromRow, FromValue, Row, RowIndex, Value};

use crate::error::DbError;

/// Something that runs SQL statements.
pub trait Executor {
    /// Runs a statement and returns its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError>;

    /// Runs a statement and returns the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Runs one or more parameterless statements (DDL) via the simple protocol.
    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Runs a statement that must return exactly one row.
    fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Row, DbError> {
        let mut rows = self.query(sql, params)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(DbError::query("query returned no rows")),
            n => Err(DbError::query(format!("query returned {n} rows, expected one"))),
        }
    }

    /// Runs a statement that returns at most one row.
    fn query_opt(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, DbError> {
        let mut rows = self.query(sql, params)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.remove(0))),
            n => Err(DbError::query(format!("query returned {n} rows, expected at most one"))),
        }
    }
}

/// An open transaction. Dropping it without [`Transaction::commit`] rolls back.
pub trait Transaction: Executor {
    fn commit(self: Box<Self>) -> Result<(), DbError>;
}

/// A connection that can open transactions.
pub trait Database: Executor {
    fn transaction(&mut self) -> Result<Box<dyn Transaction + '_>, DbError>;
}
