//! Query helpers for request-serving code.
//!
//! [`OptimizedQueryBuilder`] bundles pagination, batched writes, grouped and
//! time-bucketed aggregation and [`TransactionOptimizer`] retries. Every
//! table and column name goes in as an [`Ident`]; values are always bound as
//! parameters.
//!
//! ```
//! use pgkeeper_core::db::{Row, Value};
//! use pgkeeper_core::db::mock::MockDatabase;
//! use pgkeeper_core::ident::{Ident, SortDirection};
//! use pgkeeper_core::query::OptimizedQueryBuilder;
//!
//! let mut db = MockDatabase::new();
//! db.on_query("COUNT(*)", vec![Row::from_pairs([("total", Value::from(3))])]);
//!
//! let builder = OptimizedQueryBuilder::new();
//! let page = builder
//!     .paginate(Ident::new("orders").unwrap())
//!     .order_by(Ident::new("id").unwrap(), SortDirection::Asc)
//!     .execute(&mut db, 1, 2)
//!     .unwrap();
//! assert_eq!(page.total_pages, 2);
//! assert!(page.has_next);
//! ```

mod aggregate;
mod batch;
mod filter;
mod pagination;
mod retry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use aggregate::{TimeSeriesDataPoint, TimeSeriesQuery};
pub use batch::{MAX_BIND_PARAMS, batch_insert, bulk_update, bulk_update_by_id, upsert};
pub use filter::{CompareOp, Filter};
pub use pagination::{KeysetPagination, PaginatedQuery, PaginatedResult};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES, RetryPolicy, TransactionOptimizer, is_retryable,
    with_statement_timeout,
};

use crate::analyzer::QueryAnalyzer;
use crate::db::{Database, Executor, Row, Transaction, Value};
use crate::error::{DbResultExt, Result};
use crate::ident::{Ident, SortDirection};

/// Default rows per INSERT statement.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Routes reads through a [`QueryAnalyzer`] when one is attached, so slow
/// ones end up in its log.
#[derive(Clone, Default)]
pub(crate) struct Diagnostics(Option<Arc<QueryAnalyzer>>);

impl Diagnostics {
    pub(crate) fn query<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        caller: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        match &self.0 {
            Some(analyzer) => analyzer.timed(db, caller, sql, params),
            None => db.query(sql, params).during(caller),
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Diagnostics(analyzer)" } else { "Diagnostics(off)" })
    }
}

/// Entry point for the query helpers.
#[derive(Clone, Debug)]
pub struct OptimizedQueryBuilder {
    diagnostics: Diagnostics,
    optimizer: TransactionOptimizer,
    batch_size: usize,
}

impl Default for OptimizedQueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizedQueryBuilder {
    pub fn new() -> Self {
        Self {
            diagnostics: Diagnostics::default(),
            optimizer: TransactionOptimizer::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Times reads through `analyzer`. Diagnostic only; results are unchanged.
    pub fn with_analyzer(mut self, analyzer: Arc<QueryAnalyzer>) -> Self {
        self.diagnostics = Diagnostics(Some(analyzer));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.optimizer = TransactionOptimizer::new(policy);
        self
    }

    /// Rows per INSERT statement, capped by [`MAX_BIND_PARAMS`].
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn transaction_optimizer(&self) -> &TransactionOptimizer {
        &self.optimizer
    }

    pub fn paginate(&self, table: Ident) -> PaginatedQuery {
        PaginatedQuery::new(table).with_diagnostics(self.diagnostics.clone())
    }

    pub fn keyset(
        &self,
        table: Ident,
        sort_column: Ident,
        direction: SortDirection,
    ) -> KeysetPagination {
        KeysetPagination::new(table, sort_column, direction)
            .with_diagnostics(self.diagnostics.clone())
    }

    pub fn batch_insert<D: Database + ?Sized>(
        &self,
        db: &mut D,
        table: &Ident,
        columns: &[Ident],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        batch_insert(db, table, columns, rows, self.batch_size)
    }

    pub fn upsert<D: Database + ?Sized>(
        &self,
        db: &mut D,
        table: &Ident,
        columns: &[Ident],
        conflict_columns: &[Ident],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        upsert(db, table, columns, conflict_columns, rows, self.batch_size)
    }

    pub fn bulk_update<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        table: &Ident,
        set: &[(Ident, Value)],
        filters: &[Filter],
    ) -> Result<u64> {
        bulk_update(db, table, set, filters)
    }

    pub fn bulk_update_by_id<D: Database + ?Sized>(
        &self,
        db: &mut D,
        table: &Ident,
        id_column: &Ident,
        column: &Ident,
        updates: &[(Value, Value)],
    ) -> Result<u64> {
        bulk_update_by_id(db, table, id_column, column, updates, self.batch_size)
    }

    /// `SUM(sum_column)` per group; NULL groups are keyed `"NULL"`.
    pub fn sum_by_group<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        table: &Ident,
        group_column: &Ident,
        sum_column: &Ident,
        filters: &[Filter],
    ) -> Result<BTreeMap<String, f64>> {
        aggregate::sum_by_group(db, &self.diagnostics, table, group_column, sum_column, filters)
    }

    pub fn count_by_group<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        table: &Ident,
        group_column: &Ident,
        filters: &[Filter],
    ) -> Result<BTreeMap<String, i64>> {
        aggregate::count_by_group(db, &self.diagnostics, table, group_column, filters)
    }

    pub fn aggregate_by_interval<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        query: &TimeSeriesQuery,
    ) -> Result<Vec<TimeSeriesDataPoint>> {
        aggregate::aggregate_by_interval(db, &self.diagnostics, query)
    }

    /// See [`TransactionOptimizer::execute_with_retry`].
    pub fn execute_with_retry<D, T, F>(&self, db: &mut D, max_retries: u32, work: F) -> Result<T>
    where
        D: Database + ?Sized,
        F: FnMut(&mut dyn Transaction) -> Result<T>,
    {
        self.optimizer.execute_with_retry(db, max_retries, work)
    }

    /// See [`with_statement_timeout`].
    pub fn with_statement_timeout<D, T, F>(&self, db: &mut D, timeout: Duration, work: F) -> Result<T>
    where
        D: Database + ?Sized,
        F: FnOnce(&mut dyn Transaction) -> Result<T>,
    {
        with_statement_timeout(db, timeout, work)
    }
}
