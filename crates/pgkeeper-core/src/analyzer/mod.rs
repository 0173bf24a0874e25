//! Query plan analysis and catalog statistics.
//!
//! [`QueryAnalyzer`] ties together EXPLAIN parsing ([`plan`]), the in-memory
//! [`slow_log`] and the cached [`index_monitor`], and reads aggregate query and
//! table statistics from `pg_stat_statements` and `pg_stat_user_tables`.

pub mod index_monitor;
pub mod plan;
mod queries;
pub mod slow_log;

use std::sync::Mutex;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use index_monitor::{IndexMonitorConfig, IndexUsageMonitor, IndexUsageStats};
pub use plan::{ExplainPlan, ExplainPlanNode, PlanMetrics};
pub use slow_log::{SlowQuery, SlowQueryLogger};

use crate::db::{Executor, Row, Value};
use crate::error::{DbError, DbResultExt, Error, Result};
use queries::{
    build_explain_query, build_extension_check_query, build_query_stats_query,
    build_reset_query_stats_query, build_table_stats_query,
};

/// Configuration for [`QueryAnalyzer`].
#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    /// Initial state of the enable flag. Default: true.
    pub enabled: bool,
    /// Queries at least this slow are logged. Default: 100 ms.
    pub slow_query_threshold: Duration,
    /// Capacity of the slow-query ring. Default: 1000.
    pub max_slow_queries: usize,
    /// Lifetime of cached index statistics. Default: 1 hour.
    pub index_scan_interval: Duration,
    /// Receives every logged slow query.
    pub events: Option<Sender<SlowQuery>>,
    /// Attach an EXPLAIN ANALYZE plan to slow read-only queries seen by
    /// [`QueryAnalyzer::timed`]. The statement is executed a second time.
    /// Default: false.
    pub explain_slow_queries: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_query_threshold: slow_log::DEFAULT_SLOW_QUERY_THRESHOLD,
            max_slow_queries: slow_log::DEFAULT_MAX_SLOW_QUERIES,
            index_scan_interval: index_monitor::DEFAULT_INDEX_SCAN_INTERVAL,
            events: None,
            explain_slow_queries: false,
        }
    }
}

/// Aggregate statistics of one normalized statement from pg_stat_statements.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryStats {
    pub queryid: Option<i64>,
    pub query: String,
    pub calls: i64,
    pub total_exec_time_ms: f64,
    pub mean_exec_time_ms: f64,
    pub min_exec_time_ms: f64,
    pub max_exec_time_ms: f64,
    pub stddev_exec_time_ms: f64,
    pub rows: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    /// Percentage of shared blocks served from the buffer cache.
    pub cache_hit_ratio: f64,
}

impl QueryStats {
    fn from_row(row: &Row) -> std::result::Result<Self, DbError> {
        Ok(Self {
            queryid: row.try_get("queryid")?,
            query: row.try_get("query")?,
            calls: row.try_get("calls")?,
            total_exec_time_ms: row.try_get("total_exec_time")?,
            mean_exec_time_ms: row.try_get("mean_exec_time")?,
            min_exec_time_ms: row.try_get("min_exec_time")?,
            max_exec_time_ms: row.try_get("max_exec_time")?,
            stddev_exec_time_ms: row.try_get("stddev_exec_time")?,
            rows: row.try_get("rows")?,
            shared_blks_hit: row.try_get("shared_blks_hit")?,
            shared_blks_read: row.try_get("shared_blks_read")?,
            cache_hit_ratio: row.try_get("cache_hit_ratio")?,
        })
    }
}

/// Activity counters of one user table from pg_stat_user_tables.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableStats {
    pub schema_name: String,
    pub table_name: String,
    pub seq_scan: i64,
    pub seq_tup_read: i64,
    pub idx_scan: i64,
    pub idx_tup_fetch: i64,
    pub n_tup_ins: i64,
    pub n_tup_upd: i64,
    pub n_tup_del: i64,
    pub n_live_tup: i64,
    pub n_dead_tup: i64,
    pub last_vacuum: Option<DateTime<Utc>>,
    pub last_autovacuum: Option<DateTime<Utc>>,
    pub last_analyze: Option<DateTime<Utc>>,
    pub last_autoanalyze: Option<DateTime<Utc>>,
    pub size_bytes: i64,
}

impl TableStats {
    fn from_row(row: &Row) -> std::result::Result<Self, DbError> {
        Ok(Self {
            schema_name: row.try_get("schemaname")?,
            table_name: row.try_get("relname")?,
            seq_scan: row.try_get("seq_scan")?,
            seq_tup_read: row.try_get("seq_tup_read")?,
            idx_scan: row.try_get("idx_scan")?,
            idx_tup_fetch: row.try_get("idx_tup_fetch")?,
            n_tup_ins: row.try_get("n_tup_ins")?,
            n_tup_upd: row.try_get("n_tup_upd")?,
            n_tup_del: row.try_get("n_tup_del")?,
            n_live_tup: row.try_get("n_live_tup")?,
            n_dead_tup: row.try_get("n_dead_tup")?,
            last_vacuum: row.try_get("last_vacuum")?,
            last_autovacuum: row.try_get("last_autovacuum")?,
            last_analyze: row.try_get("last_analyze")?,
            last_autoanalyze: row.try_get("last_autoanalyze")?,
            size_bytes: row.try_get("size_bytes")?,
        })
    }

    /// Dead tuples as a percentage of all tuples.
    pub fn dead_tuple_ratio(&self) -> f64 {
        let total = self.n_live_tup + self.n_dead_tup;
        if total == 0 {
            return 0.0;
        }
        100.0 * self.n_dead_tup as f64 / total as f64
    }
}

/// Entry point for plan analysis and statistics reporting.
///
/// The analyzer owns no connection; each call borrows one.
#[derive(Debug)]
pub struct QueryAnalyzer {
    enabled: Mutex<bool>,
    explain_slow_queries: bool,
    slow_log: SlowQueryLogger,
    index_monitor: IndexUsageMonitor,
    /// Cached result of `SHOW server_version_num`.
    server_version_num: Mutex<Option<i32>>,
}

impl QueryAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let mut slow_log =
            SlowQueryLogger::new(config.slow_query_threshold, config.max_slow_queries);
        if let Some(events) = config.events {
            slow_log = slow_log.with_events(events);
        }
        Self {
            enabled: Mutex::new(config.enabled),
            explain_slow_queries: config.explain_slow_queries,
            slow_log,
            index_monitor: IndexUsageMonitor::new(IndexMonitorConfig {
                scan_interval: config.index_scan_interval,
            }),
            server_version_num: Mutex::new(None),
        }
    }

    /// Sets the advisory enable flag.
    pub fn enable(&self) {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    /// Clears the advisory enable flag.
    pub fn disable(&self) {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    /// Whether expensive analysis should run. The flag is advisory: only
    /// [`QueryAnalyzer::timed`] consults it.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn slow_query_logger(&self) -> &SlowQueryLogger {
        &self.slow_log
    }

    pub fn index_monitor(&self) -> &IndexUsageMonitor {
        &self.index_monitor
    }

    /// Returns a copy of the logged slow queries.
    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.slow_log.queries()
    }

    /// Runs `query` under `EXPLAIN ANALYZE` and parses the plan.
    ///
    /// The statement is really executed; wrap data-modifying statements in a
    /// transaction that is rolled back.
    pub fn explain_analyze<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        query: &str,
        params: &[Value],
    ) -> Result<ExplainPlan> {
        let rows = db
            .query(&build_explain_query(query), params)
            .map_err(Error::PlanExecution)?;
        let row = rows.first().ok_or(Error::EmptyPlan)?;
        let json: serde_json::Value = row
            .try_get("QUERY PLAN")
            .or_else(|_| row.try_get(0usize))
            .map_err(|e| Error::PlanParse(e.to_string()))?;
        let plan = ExplainPlan::from_json(query, &json)?;
        debug!(
            total_cost = plan.metrics.total_cost,
            execution_ms = plan.metrics.execution_time_ms,
            warnings = plan.warnings.len(),
            "plan analyzed"
        );
        Ok(plan)
    }

    /// Runs `query`, measures it and logs it when slow.
    ///
    /// Returns the rows of `query`. Failing queries are not logged.
    pub fn timed<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        caller: &str,
        query: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        let started = Instant::now();
        let rows = db.query(query, params).during(caller)?;
        let elapsed = started.elapsed();

        if !self.is_enabled() || elapsed < self.slow_log.threshold() {
            return Ok(rows);
        }

        let mut entry = SlowQuery::new(query, elapsed, rows.len() as i64, caller);
        if self.explain_slow_queries && is_read_only(query) {
            match self.explain_analyze(db, query, params) {
                Ok(plan) => entry = entry.with_plan(plan),
                Err(e) => debug!(caller, error = %e, "could not explain slow query"),
            }
        }
        self.slow_log.log(entry);
        Ok(rows)
    }

    /// Adds an externally measured query to the slow log.
    pub fn record(&self, entry: SlowQuery) -> bool {
        self.slow_log.log(entry)
    }

    /// Usage of every user index, cached for the configured interval.
    pub fn get_index_usage_stats<E: Executor + ?Sized>(
        &self,
        db: &mut E,
    ) -> Result<Vec<IndexUsageStats>> {
        self.index_monitor.stats(db)
    }

    pub fn get_unused_indexes<E: Executor + ?Sized>(
        &self,
        db: &mut E,
    ) -> Result<Vec<IndexUsageStats>> {
        self.index_monitor.unused_indexes(db)
    }

    pub fn get_duplicate_indexes<E: Executor + ?Sized>(
        &self,
        db: &mut E,
    ) -> Result<Vec<IndexUsageStats>> {
        self.index_monitor.duplicate_indexes(db)
    }

    /// Statements with the highest mean execution time.
    pub fn get_top_slow_queries<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        limit: i64,
    ) -> Result<Vec<QueryStats>> {
        self.query_stats(db, "mean_exec_time", limit)
    }

    /// Statements with the most calls.
    pub fn get_most_frequent_queries<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        limit: i64,
    ) -> Result<Vec<QueryStats>> {
        self.query_stats(db, "calls", limit)
    }

    fn query_stats<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        order_by: &str,
        limit: i64,
    ) -> Result<Vec<QueryStats>> {
        if limit <= 0 {
            return Err(Error::InvalidArgument(format!(
                "limit must be positive, got {limit}"
            )));
        }
        self.require_pg_stat_statements(db)?;
        let version = self.server_version_num(db);
        let sql = build_query_stats_query(version, order_by);
        let rows = db
            .query(&sql, &[Value::from(limit)])
            .during("read pg_stat_statements")?;
        rows.iter()
            .map(QueryStats::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .during("decode pg_stat_statements")
    }

    /// Clears all pg_stat_statements counters of the server.
    pub fn reset_query_stats<E: Executor + ?Sized>(&self, db: &mut E) -> Result<()> {
        self.require_pg_stat_statements(db)?;
        db.query(build_reset_query_stats_query(), &[])
            .during("reset pg_stat_statements")?;
        info!("pg_stat_statements counters reset");
        Ok(())
    }

    /// Activity counters of every user table.
    pub fn get_table_stats<E: Executor + ?Sized>(&self, db: &mut E) -> Result<Vec<TableStats>> {
        let rows = db
            .query(build_table_stats_query(), &[])
            .during("read pg_stat_user_tables")?;
        rows.iter()
            .map(TableStats::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .during("decode pg_stat_user_tables")
    }

    fn require_pg_stat_statements<E: Executor + ?Sized>(&self, db: &mut E) -> Result<()> {
        let row = db
            .query_opt(build_extension_check_query(), &[])
            .during("check pg_stat_statements")?;
        if row.is_none() {
            return Err(Error::InvalidArgument(
                "extension pg_stat_statements is not installed".to_string(),
            ));
        }
        Ok(())
    }

    /// Detects the server version once. Failures are not cached.
    fn server_version_num<E: Executor + ?Sized>(&self, db: &mut E) -> Option<i32> {
        let mut cached = self
            .server_version_num
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if cached.is_none() {
            match detect_server_version(db) {
                Ok(v) => *cached = Some(v),
                Err(e) => warn!(error = %e, "failed to detect server version"),
            }
        }
        *cached
    }
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

fn detect_server_version<E: Executor + ?Sized>(db: &mut E) -> Result<i32> {
    let row = db
        .query_one("SHOW server_version_num", &[])
        .during("detect server version")?;
    let raw: String = row.try_get(0usize).during("detect server version")?;
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("bad server_version_num {raw:?}")))
}

fn is_read_only(query: &str) -> bool {
    let head = query.trim_start();
    let head = head.get(..6).unwrap_or(head);
    head.eq_ignore_ascii_case("select")
}
