//! PostgreSQL backend on top of the synchronous `postgres` client.

use std::sync::Arc;

use postgres::types::ToSql;
use postgres::{Client, NoTls};
use tracing::{debug, trace};

use super::pg_types::decode_value;
use super::{Database, Executor, Row, Transaction, Value};
use crate::error::DbError;

/// A single PostgreSQL connection.
///
/// Connects using standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
///
/// The connection is opened lazily and reopened after the server closes it.
pub struct PgDatabase {
    connection_string: String,
    client: Option<Client>,
    server_version_num: Option<i32>,
}

impl PgDatabase {
    /// Builds a connection from environment variables.
    ///
    /// Uses $USER as default if PGUSER is not set.
    pub fn from_env() -> Result<Self, DbError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| DbError::Connection("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!(
                "host={} port={} user={} dbname={}",
                host, port, user, database
            )
        } else {
            format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, database
            )
        };

        Ok(Self::with_connection_string(connection_string))
    }

    /// Builds a connection from an explicit libpq-style connection string.
    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: None,
            server_version_num: None,
        }
    }

    /// Connects immediately instead of on first use.
    pub fn try_connect(&mut self) -> Result<(), DbError> {
        self.ensure_connected().map(|_| ())
    }

    /// Returns `server_version_num` of the connected server.
    pub fn server_version_num(&mut self) -> Result<Option<i32>, DbError> {
        self.ensure_connected()?;
        Ok(self.server_version_num)
    }

    fn ensure_connected(&mut self) -> Result<&mut Client, DbError> {
        if self.client.as_ref().is_some_and(Client::is_closed) {
            debug!("PostgreSQL connection closed, reconnecting");
            self.client = None;
        }

        if self.client.is_none() {
            let mut client = Client::connect(&self.connection_string, NoTls)
                .map_err(|e| DbError::Connection(format_postgres_error(&e)))?;

            // Determine server version once per (re)connect.
            self.server_version_num = client
                .query_one("SHOW server_version_num", &[])
                .ok()
                .and_then(|row| row.try_get::<_, String>(0).ok())
                .and_then(|v| v.parse::<i32>().ok());

            debug!(server_version_num = ?self.server_version_num, "connected to PostgreSQL");
            self.client = Some(client);
        }

        self.client
            .as_mut()
            .ok_or_else(|| DbError::Connection("not connected".to_string()))
    }
}

impl Executor for PgDatabase {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        trace!(sql, "query");
        let client = self.ensure_connected()?;
        let rows = client.query(sql, &param_refs(params))?;
        convert_rows(&rows)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        trace!(sql, "execute");
        let client = self.ensure_connected()?;
        Ok(client.execute(sql, &param_refs(params))?)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        trace!(sql, "batch_execute");
        let client = self.ensure_connected()?;
        Ok(client.batch_execute(sql)?)
    }
}

impl Database for PgDatabase {
    fn transaction(&mut self) -> Result<Box<dyn Transaction + '_>, DbError> {
        let client = self.ensure_connected()?;
        let inner = client.transaction()?;
        Ok(Box::new(PgTransaction { inner }))
    }
}

/// A transaction on a [`PgDatabase`]. Rolls back on drop unless committed.
pub struct PgTransaction<'a> {
    inner: postgres::Transaction<'a>,
}

impl Executor for PgTransaction<'_> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        trace!(sql, "query (tx)");
        let rows = self.inner.query(sql, &param_refs(params))?;
        convert_rows(&rows)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        trace!(sql, "execute (tx)");
        Ok(self.inner.execute(sql, &param_refs(params))?)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        trace!(sql, "batch_execute (tx)");
        Ok(self.inner.batch_execute(sql)?)
    }
}

impl Transaction for PgTransaction<'_> {
    fn commit(self: Box<Self>) -> Result<(), DbError> {
        Ok(self.inner.commit()?)
    }
}

fn param_refs(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn convert_rows(rows: &[postgres::Row]) -> Result<Vec<Row>, DbError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns: Arc<[String]> = first
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    rows.iter()
        .map(|row| {
            let values = (0..row.len())
                .map(|i| decode_value(row, i))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Row::new(columns.clone(), values))
        })
        .collect()
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
