//! Scripted in-memory database for tests.
//!
//! Responses are matched by SQL substring, first match wins. Every statement,
//! including `BEGIN`/`COMMIT`/`ROLLBACK` issued by transactions, is recorded so
//! tests can assert on the exact SQL that was sent.
//!
//! ```
//! use pgkeeper_core::db::{Executor, Row, Value};
//! use pgkeeper_core::db::mock::MockDatabase;
//!
//! let mut db = MockDatabase::new();
//! db.on_query("FROM pg_class", vec![Row::from_pairs([("relname", Value::from("events"))])]);
//!
//! let rows = db.query("SELECT relname FROM pg_class", &[]).unwrap();
//! assert_eq!(rows.len(), 1);
//! assert_eq!(db.statements()[0].sql, "SELECT relname FROM pg_class");
//! ```

use std::collections::VecDeque;

use super::{Database, Executor, Row, Transaction, Value};
use crate::error::DbError;

/// How a statement was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Execute,
    Batch,
    Begin,
    Commit,
    Rollback,
}

/// A statement seen by the mock.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<Value>,
    /// True when issued inside a transaction.
    pub in_transaction: bool,
}

/// A scripted reply.
#[derive(Clone, Debug)]
pub enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
    Error(DbError),
}

type Handler = Box<dyn FnMut(&str, &[Value]) -> Option<Result<Reply, DbError>> + Send>;

struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

/// Scripted database. See the module docs.
#[derive(Default)]
pub struct MockDatabase {
    rules: Vec<Rule>,
    handler: Option<Handler>,
    log: Vec<Statement>,
    fail_begin: VecDeque<DbError>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `rows` for every statement containing `pattern`.
    pub fn on_query(&mut self, pattern: &str, rows: Vec<Row>) -> &mut Self {
        self.push_rule(pattern, Reply::Rows(rows), None)
    }

    /// Returns `rows` for the next statement containing `pattern`, once.
    pub fn on_query_once(&mut self, pattern: &str, rows: Vec<Row>) -> &mut Self {
        self.push_rule(pattern, Reply::Rows(rows), Some(1))
    }

    /// Reports `affected` rows for every statement containing `pattern`.
    pub fn on_execute(&mut self, pattern: &str, affected: u64) -> &mut Self {
        self.push_rule(pattern, Reply::Affected(affected), None)
    }

    /// Reports `affected` rows for the next statement containing `pattern`, once.
    pub fn on_execute_once(&mut self, pattern: &str, affected: u64) -> &mut Self {
        self.push_rule(pattern, Reply::Affected(affected), Some(1))
    }

    /// Fails every statement containing `pattern`.
    pub fn on_error(&mut self, pattern: &str, error: DbError) -> &mut Self {
        self.push_rule(pattern, Reply::Error(error), None)
    }

    /// Fails the next `times` statements containing `pattern`.
    pub fn on_error_times(&mut self, pattern: &str, error: DbError, times: usize) -> &mut Self {
        self.push_rule(pattern, Reply::Error(error), Some(times))
    }

    /// Installs a fallback consulted when no rule matches.
    ///
    /// Returning `None` falls through to the default reply (no rows / 0 affected).
    pub fn with_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&str, &[Value]) -> Option<Result<Reply, DbError>> + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Makes the next `BEGIN` fail.
    pub fn fail_next_begin(&mut self, error: DbError) -> &mut Self {
        self.fail_begin.push_back(error);
        self
    }

    /// All statements seen so far, in order.
    pub fn statements(&self) -> &[Statement] {
        &self.log
    }

    /// SQL text of all statements seen so far.
    pub fn sql_log(&self) -> Vec<&str> {
        self.log.iter().map(|s| s.sql.as_str()).collect()
    }

    /// Number of recorded statements whose SQL contains `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.log.iter().filter(|s| s.sql.contains(pattern)).count()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    fn push_rule(&mut self, pattern: &str, reply: Reply, remaining: Option<usize>) -> &mut Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
        self
    }

    fn dispatch(
        &mut self,
        kind: StatementKind,
        sql: &str,
        params: &[Value],
        in_transaction: bool,
    ) -> Result<Reply, DbError> {
        self.log.push(Statement {
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
            in_transaction,
        });

        let matched = self.rules.iter_mut().find(|r| {
            r.remaining.is_none_or(|n| n > 0) && sql.contains(r.pattern.as_str())
        });
        if let Some(rule) = matched {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return match &rule.reply {
                Reply::Error(e) => Err(e.clone()),
                other => Ok(other.clone()),
            };
        }

        if let Some(handler) = self.handler.as_mut()
            && let Some(reply) = handler(sql, params)
        {
            return match reply? {
                Reply::Error(e) => Err(e),
                other => Ok(other),
            };
        }

        Ok(match kind {
            StatementKind::Query => Reply::Rows(Vec::new()),
            _ => Reply::Affected(0),
        })
    }

    fn run_query(&mut self, sql: &str, params: &[Value], tx: bool) -> Result<Vec<Row>, DbError> {
        match self.dispatch(StatementKind::Query, sql, params, tx)? {
            Reply::Rows(rows) => Ok(rows),
            Reply::Affected(_) => Ok(Vec::new()),
            Reply::Error(e) => Err(e),
        }
    }

    fn run_execute(&mut self, sql: &str, params: &[Value], tx: bool) -> Result<u64, DbError> {
        match self.dispatch(StatementKind::Execute, sql, params, tx)? {
            Reply::Affected(n) => Ok(n),
            Reply::Rows(rows) => Ok(rows.len() as u64),
            Reply::Error(e) => Err(e),
        }
    }

    fn run_batch(&mut self, sql: &str, tx: bool) -> Result<(), DbError> {
        self.dispatch(StatementKind::Batch, sql, &[], tx).map(|_| ())
    }
}

impl Executor for MockDatabase {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        self.run_query(sql, params, false)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        self.run_execute(sql, params, false)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.run_batch(sql, false)
    }
}

impl Database for MockDatabase {
    fn transaction(&mut self) -> Result<Box<dyn Transaction + '_>, DbError> {
        self.log.push(Statement {
            kind: StatementKind::Begin,
            sql: "BEGIN".to_string(),
            params: Vec::new(),
            in_transaction: true,
        });
        if let Some(e) = self.fail_begin.pop_front() {
            return Err(e);
        }
        Ok(Box::new(MockTransaction {
            db: self,
            done: false,
        }))
    }
}

/// Transaction on a [`MockDatabase`].
pub struct MockTransaction<'a> {
    db: &'a mut MockDatabase,
    done: bool,
}

impl Executor for MockTransaction<'_> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        self.db.run_query(sql, params, true)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        self.db.run_execute(sql, params, true)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.db.run_batch(sql, true)
    }
}

impl Transaction for MockTransaction<'_> {
    fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.done = true;
        match self.db.dispatch(StatementKind::Commit, "COMMIT", &[], true)? {
            Reply::Error(e) => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for MockTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.db.log.push(Statement {
                kind: StatementKind::Rollback,
                sql: "ROLLBACK".to_string(),
                params: Vec::new(),
                in_transaction: true,
            });
        }
    }
}
