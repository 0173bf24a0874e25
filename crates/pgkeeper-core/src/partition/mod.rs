//! Time-range partition lifecycle.
//!
//! [`PartitionManager`] creates, lists, attaches, detaches and drops range
//! partitions named `<parent>_<suffix>` (see [`Granularity::suffix`]), converts
//! an unpartitioned table into a partitioned copy, and migrates rows into it.
//! [`MaintenanceRunner`] keeps a set of tables ahead of incoming data and
//! within their retention window.

mod bounds;
pub mod maintenance;
mod migrate;
mod naming;

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use bounds::{BoundValue, PartitionBound, parse_bound, parse_timestamp};
pub use maintenance::{
    MaintenanceConfig, MaintenanceHandle, MaintenanceReport, MaintenanceRunner, MaintenanceStopper,
    TableMaintenance,
};
pub use migrate::{CHECKPOINT_TABLE, MigrationOptions, MigrationReport};
pub use naming::{Granularity, PartitionStrategy};

use crate::db::{Database, Executor, Row, Value};
use crate::error::{DbError, DbResultExt, Error, Result};
use crate::ident::{Ident, quote_qualified};
use crate::util::parse_retention;

/// Partitions created ahead of the current one.
pub const DEFAULT_LOOKAHEAD: u32 = 3;

/// How one table is partitioned and pruned.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionConfig {
    pub table: Ident,
    pub column: Ident,
    pub strategy: PartitionStrategy,
    pub granularity: Granularity,
    /// Partitions ending before `now - retention` are dropped. Zero keeps
    /// everything.
    pub retention: TimeDelta,
}

impl PartitionConfig {
    pub fn new(table: Ident, column: Ident, granularity: Granularity) -> Self {
        Self {
            table,
            column,
            strategy: PartitionStrategy::Range,
            granularity,
            retention: TimeDelta::zero(),
        }
    }

    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }

    pub fn has_retention(&self) -> bool {
        self.retention > TimeDelta::zero()
    }
}

/// Parses `table:column:granularity[:retention]`, e.g.
/// `events:created_at:monthly:90d`.
impl FromStr for PartitionConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(Error::InvalidArgument(format!(
                "expected table:column:granularity[:retention], got {s:?}"
            )));
        }
        let mut config = PartitionConfig::new(
            Ident::new(parts[0])?,
            Ident::new(parts[1])?,
            parts[2].parse()?,
        );
        if let Some(retention) = parts.get(3) {
            config.retention =
                parse_retention(retention).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        }
        Ok(config)
    }
}

/// One child partition of a partitioned table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PartitionInfo {
    pub parent: String,
    pub schema: String,
    pub name: String,
    /// Bound expression as printed by the server.
    pub bound: String,
    /// Inclusive lower bound; `None` when not a point in time.
    pub range_start: Option<DateTime<Utc>>,
    /// Exclusive upper bound; `None` when not a point in time.
    pub range_end: Option<DateTime<Utc>>,
    pub row_count: i64,
    pub size_bytes: i64,
}

impl PartitionInfo {
    fn from_row(parent: &Ident, row: &Row) -> std::result::Result<Self, DbError> {
        let bound: String = row.try_get("bound")?;
        let parsed = parse_bound(&bound);
        Ok(Self {
            parent: parent.to_string(),
            schema: row.try_get("schemaname")?,
            name: row.try_get("partition_name")?,
            range_start: parsed.start(),
            range_end: parsed.end(),
            bound,
            row_count: 0,
            size_bytes: row.try_get("size_bytes")?,
        })
    }

    fn qualified_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

/// Roll-up over the partitions of one table.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PartitionStats {
    pub table: String,
    pub partition_count: usize,
    pub total_rows: i64,
    pub total_size_bytes: i64,
    pub oldest_start: Option<DateTime<Utc>>,
    pub newest_end: Option<DateTime<Utc>>,
}

/// Result of [`PartitionManager::setup_partitioning`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PartitionSetup {
    pub source: Ident,
    pub target: Ident,
    /// False when the target already existed as a partitioned table.
    pub created_table: bool,
    pub partitions: Vec<PartitionInfo>,
}

fn build_list_partitions_query() -> &'static str {
    r#"
        SELECT
            n.nspname::text as schemaname,
            c.relname::text as partition_name,
            COALESCE(pg_get_expr(c.relpartbound, c.oid), '')::text as bound,
            COALESCE(pg_total_relation_size(c.oid), 0)::bigint as size_bytes
        FROM pg_inherits i
        JOIN pg_class c ON c.oid = i.inhrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE i.inhparent = to_regclass($1::text)
        ORDER BY c.relname
    "#
}

/// `FOR VALUES` clause for `[start, end)` at UTC midnight, independent of the
/// session TimeZone.
fn range_bound(start: NaiveDate, end: NaiveDate) -> String {
    format!("FOR VALUES FROM ('{start} 00:00:00+00') TO ('{end} 00:00:00+00')")
}

fn build_source_range_query(source: &Ident, column: &Ident) -> String {
    format!("SELECT MIN({column})::text AS oldest, MAX({column})::text AS newest FROM {source}")
}

fn build_is_partitioned_query() -> &'static str {
    "SELECT 1 AS partitioned FROM pg_partitioned_table WHERE partrelid = to_regclass($1::text)"
}

/// Creates and prunes range partitions.
#[derive(Clone, Debug)]
pub struct PartitionManager {
    lookahead: u32,
}

impl Default for PartitionManager {
    fn default() -> Self {
        Self {
            lookahead: DEFAULT_LOOKAHEAD,
        }
    }
}

impl PartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of future partitions [`setup_partitioning`] creates.
    ///
    /// [`setup_partitioning`]: PartitionManager::setup_partitioning
    pub fn with_lookahead(mut self, lookahead: u32) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn lookahead(&self) -> u32 {
        self.lookahead
    }

    /// Creates the partition of `parent` covering the period containing `at`.
    ///
    /// Issues `CREATE TABLE IF NOT EXISTS`, so an existing partition is not an
    /// error.
    pub fn create_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        granularity: Granularity,
        at: NaiveDate,
    ) -> Result<PartitionInfo> {
        let (start, end) = granularity.range(at).ok_or_else(|| {
            Error::InvalidArgument(format!("no {granularity} partition after {at}"))
        })?;
        let name = parent.with_suffix(&granularity.suffix(start))?;
        let bound = range_bound(start, end);
        let sql = format!("CREATE TABLE IF NOT EXISTS {name} PARTITION OF {parent} {bound}");
        db.batch_execute(&sql)
            .during(format!("create partition {name}"))?;
        info!(table = %parent, partition = %name, %start, %end, "partition ensured");

        Ok(PartitionInfo {
            parent: parent.to_string(),
            schema: parent.schema().unwrap_or("public").to_string(),
            name: name.unqualified().to_string(),
            bound,
            range_start: Some(start.and_time(NaiveTime::MIN).and_utc()),
            range_end: Some(end.and_time(NaiveTime::MIN).and_utc()),
            row_count: 0,
            size_bytes: 0,
        })
    }

    /// Partition `[first of month, first of next month)`, named `<parent>_YYYY_MM`.
    pub fn create_monthly_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        month: NaiveDate,
    ) -> Result<PartitionInfo> {
        self.create_partition(db, parent, Granularity::Monthly, month)
    }

    /// Partition for one day, named `<parent>_YYYY_MM_DD`.
    pub fn create_daily_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        day: NaiveDate,
    ) -> Result<PartitionInfo> {
        self.create_partition(db, parent, Granularity::Daily, day)
    }

    /// Partition for one ISO week, named `<parent>_YYYY_wWW`.
    pub fn create_weekly_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        week: NaiveDate,
    ) -> Result<PartitionInfo> {
        self.create_partition(db, parent, Granularity::Weekly, week)
    }

    /// Partition for one calendar year, named `<parent>_YYYY`.
    pub fn create_yearly_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        year: NaiveDate,
    ) -> Result<PartitionInfo> {
        self.create_partition(db, parent, Granularity::Yearly, year)
    }

    /// Ensures the `count` partitions after the current one exist.
    pub fn create_future_partitions<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        granularity: Granularity,
        count: u32,
    ) -> Result<u32> {
        self.create_future_partitions_at(db, parent, granularity, count, Utc::now())
    }

    /// Like [`create_future_partitions`] with an explicit clock.
    ///
    /// Failures are logged per partition. Returns how many partitions were
    /// ensured; fails only when every attempt failed.
    ///
    /// [`create_future_partitions`]: PartitionManager::create_future_partitions
    pub fn create_future_partitions_at<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        granularity: Granularity,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let today = now.date_naive();
        let mut ensured = 0;
        let mut first_error = None;
        for i in 1..=count {
            let Some(at) = granularity.add(today, i) else {
                break;
            };
            match self.create_partition(db, parent, granularity, at) {
                Ok(_) => ensured += 1,
                Err(e) => {
                    warn!(table = %parent, error = %e, "failed to create future partition");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if ensured == 0 => Err(e),
            _ => Ok(ensured),
        }
    }

    /// Drops partitions whose upper bound lies before `now - retention`.
    pub fn drop_old_partitions<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        retention: TimeDelta,
    ) -> Result<u32> {
        self.drop_old_partitions_at(db, parent, retention, Utc::now())
    }

    /// Like [`drop_old_partitions`] with an explicit clock.
    ///
    /// Best effort: a failed drop is logged and the rest are still tried.
    /// Partitions without a time upper bound are never dropped. Returns the
    /// number of partitions dropped.
    ///
    /// [`drop_old_partitions`]: PartitionManager::drop_old_partitions
    pub fn drop_old_partitions_at<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        retention: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        if retention <= TimeDelta::zero() {
            return Err(Error::InvalidArgument(format!(
                "retention must be positive, got {retention}"
            )));
        }
        let cutoff = now - retention;
        let partitions = self.list_partitions(db, parent)?;

        let mut dropped = 0;
        for p in &partitions {
            let Some(end) = p.range_end else {
                debug!(partition = %p.name, bound = %p.bound, "no time upper bound, kept");
                continue;
            };
            if end >= cutoff {
                continue;
            }
            let sql = format!("DROP TABLE IF EXISTS {}", p.qualified_name());
            match db.batch_execute(&sql) {
                Ok(()) => {
                    dropped += 1;
                    info!(table = %parent, partition = %p.name, %end, "expired partition dropped");
                }
                Err(e) => {
                    warn!(table = %parent, partition = %p.name, error = %e, "failed to drop partition");
                }
            }
        }
        Ok(dropped)
    }

    /// Detaches `partition` from `parent`, keeping it as a standalone table.
    pub fn detach_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        partition: &Ident,
    ) -> Result<()> {
        db.batch_execute(&format!("ALTER TABLE {parent} DETACH PARTITION {partition}"))
            .during(format!("detach partition {partition}"))?;
        info!(table = %parent, %partition, "partition detached");
        Ok(())
    }

    /// Attaches an existing table as the partition `[start, end)` of `parent`.
    pub fn attach_partition<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
        partition: &Ident,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<()> {
        if start >= end {
            return Err(Error::InvalidArgument(format!(
                "empty range [{start}, {end})"
            )));
        }
        db.batch_execute(&format!(
            "ALTER TABLE {parent} ATTACH PARTITION {partition} {}",
            range_bound(start, end)
        ))
        .during(format!("attach partition {partition}"))?;
        info!(table = %parent, %partition, %start, %end, "partition attached");
        Ok(())
    }

    /// Partitions of `parent` with row counts, ordered by range start.
    ///
    /// Row counts cost one `COUNT(*)` per partition.
    pub fn get_partitions<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
    ) -> Result<Vec<PartitionInfo>> {
        let mut partitions = self.list_partitions(db, parent)?;
        for p in &mut partitions {
            let sql = format!("SELECT COUNT(*)::bigint AS n FROM {}", p.qualified_name());
            let row = db
                .query_one(&sql, &[])
                .during(format!("count rows of {}", p.name))?;
            p.row_count = row.try_get("n").during(format!("count rows of {}", p.name))?;
        }
        Ok(partitions)
    }

    /// Partitions of `parent` without row counts.
    fn list_partitions<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
    ) -> Result<Vec<PartitionInfo>> {
        let rows = db
            .query(build_list_partitions_query(), &[Value::from(parent.as_str())])
            .during(format!("list partitions of {parent}"))?;
        let mut partitions = rows
            .iter()
            .map(|r| PartitionInfo::from_row(parent, r))
            .collect::<std::result::Result<Vec<_>, _>>()
            .during(format!("decode partitions of {parent}"))?;
        partitions.sort_by_key(|p| p.range_start);
        Ok(partitions)
    }

    /// Counts, sizes and overall time span of the partitions of `parent`.
    pub fn get_partition_stats<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        parent: &Ident,
    ) -> Result<PartitionStats> {
        let partitions = self.get_partitions(db, parent)?;
        Ok(PartitionStats {
            table: parent.to_string(),
            partition_count: partitions.len(),
            total_rows: partitions.iter().map(|p| p.row_count).sum(),
            total_size_bytes: partitions.iter().map(|p| p.size_bytes).sum(),
            oldest_start: partitions.iter().filter_map(|p| p.range_start).min(),
            newest_end: partitions.iter().filter_map(|p| p.range_end).max(),
        })
    }

    /// Whether `table` exists and is a partitioned table.
    pub fn is_table_partitioned<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        table: &Ident,
    ) -> Result<bool> {
        let row = db
            .query_opt(build_is_partitioned_query(), &[Value::from(table.as_str())])
            .during(format!("check partitioning of {table}"))?;
        Ok(row.is_some())
    }

    /// Creates `<table>_partitioned`, shaped like `table` and range-partitioned
    /// on the configured column, with one partition for every period from the
    /// oldest row of `table` through the newest row or the next
    /// [`lookahead`](PartitionManager::lookahead) periods, whichever is later.
    /// Every existing row therefore has a partition to migrate into.
    ///
    /// Runs in one transaction. A target that is already partitioned is kept
    /// and only its partitions are ensured.
    pub fn setup_partitioning<D: Database + ?Sized>(
        &self,
        db: &mut D,
        config: &PartitionConfig,
        now: DateTime<Utc>,
    ) -> Result<PartitionSetup> {
        if config.strategy != PartitionStrategy::Range {
            return Err(Error::InvalidArgument(format!(
                "{} partitioning is not supported",
                config.strategy.as_sql()
            )));
        }
        let source = &config.table;
        let target = source.with_suffix("partitioned")?;
        let exists = self.is_table_partitioned(db, &target)?;
        let (oldest, newest) = self.source_range(db, source, &config.column)?;

        let mut tx = db.transaction().during("begin partition setup")?;
        if exists {
            info!(table = %source, %target, "already partitioned");
        } else {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {target} \
                 (LIKE {source} INCLUDING DEFAULTS INCLUDING CONSTRAINTS) \
                 PARTITION BY RANGE ({column})",
                column = config.column
            );
            tx.batch_execute(&sql)
                .during(format!("create partitioned table {target}"))?;
        }

        let today = now.date_naive();
        let ahead = config.granularity.add(today, self.lookahead).unwrap_or(today);
        let first = oldest.map_or(today, |d| d.min(today));
        let last = newest.map_or(ahead, |d| d.max(ahead));
        let mut partitions = Vec::new();
        let mut at = config.granularity.floor(first);
        while at <= last {
            partitions.push(self.create_partition(&mut *tx, &target, config.granularity, at)?);
            match config.granularity.add(at, 1) {
                Some(next) => at = next,
                None => break,
            }
        }
        tx.commit().during("commit partition setup")?;

        info!(
            table = %source,
            %target,
            granularity = %config.granularity,
            partitions = partitions.len(),
            "partitioning set up"
        );
        Ok(PartitionSetup {
            source: source.clone(),
            target,
            created_table: !exists,
            partitions,
        })
    }

    /// Dates of the oldest and newest `column` values in `source`, if any.
    fn source_range<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        source: &Ident,
        column: &Ident,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let Some(row) = db
            .query_opt(&build_source_range_query(source, column), &[])
            .during(format!("read {column} range of {source}"))?
        else {
            return Ok((None, None));
        };
        let date = |name: &str| -> Result<Option<NaiveDate>> {
            let text: Option<String> = row.try_get(name)?;
            match text {
                None => Ok(None),
                Some(t) => parse_timestamp(&t).map(|ts| Some(ts.date_naive())).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "{source}.{column} value {t:?} is not a date or timestamp"
                    ))
                }),
            }
        };
        let range = (date("oldest")?, date("newest")?);
        debug!(table = %source, oldest = ?range.0, newest = ?range.1, "source range");
        Ok(range)
    }

    /// Renames `table` to `<table>_legacy` and `<table>_partitioned` to
    /// `table` in one transaction. Returns the legacy name.
    pub fn swap_in_partitioned<D: Database + ?Sized>(
        &self,
        db: &mut D,
        table: &Ident,
    ) -> Result<Ident> {
        let target = table.with_suffix("partitioned")?;
        let legacy = table.with_suffix("legacy")?;
        if !self.is_table_partitioned(db, &target)? {
            return Err(Error::InvalidArgument(format!(
                "{target} is not a partitioned table"
            )));
        }

        let mut tx = db.transaction().during("begin swap")?;
        tx.batch_execute(&format!(
            "ALTER TABLE {table} RENAME TO {}",
            legacy.unqualified()
        ))
        .during(format!("rename {table}"))?;
        tx.batch_execute(&format!(
            "ALTER TABLE {target} RENAME TO {}",
            table.unqualified()
        ))
        .during(format!("rename {target}"))?;
        tx.commit().during("commit swap")?;

        info!(%table, %legacy, "partitioned table swapped in");
        Ok(legacy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::{MockDatabase, Reply, StatementKind};
    use chrono::TimeZone;

    fn ident(s: &str) -> Ident {
        Ident::new(s).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn utc(y: i32, m: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, 0, 0, 0).unwrap()
    }

    fn partition_row(name: &str, from: &str, to: &str) -> Row {
        Row::from_pairs([
            ("schemaname", Value::from("public")),
            ("partition_name", Value::from(name)),
            (
                "bound",
                Value::from(format!("FOR VALUES FROM ('{from}') TO ('{to}')")),
            ),
            ("size_bytes", Value::from(8192)),
        ])
    }

    fn monthly_rows(parent: &str, months: &[(i32, u32)]) -> Vec<Row> {
        months
            .iter()
            .map(|&(y, m)| {
                let start = d(y, m, 1);
                let end = Granularity::Monthly.add(start, 1).unwrap();
                partition_row(
                    &format!("{parent}_{}", Granularity::Monthly.suffix(start)),
                    &start.to_string(),
                    &end.to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn monthly_partition_ddl() {
        let mut db = MockDatabase::new();
        let p = PartitionManager::new()
            .create_monthly_partition(&mut db, &ident("transactions_partitioned"), d(2024, 7, 19))
            .unwrap();

        assert_eq!(p.name, "transactions_partitioned_2024_07");
        assert_eq!(p.range_start, Some(utc(2024, 7, 1)));
        assert_eq!(p.range_end, Some(utc(2024, 8, 1)));
        assert_eq!(
            db.sql_log(),
            vec![
                "CREATE TABLE IF NOT EXISTS transactions_partitioned_2024_07 \
                 PARTITION OF transactions_partitioned \
                 FOR VALUES FROM ('2024-07-01 00:00:00+00') TO ('2024-08-01 00:00:00+00')"
            ]
        );
    }

    #[test]
    fn daily_weekly_yearly_names() {
        let mut db = MockDatabase::new();
        let m = PartitionManager::new();
        let t = ident("events");
        assert_eq!(
            m.create_daily_partition(&mut db, &t, d(2024, 7, 15)).unwrap().name,
            "events_2024_07_15"
        );
        assert_eq!(
            m.create_weekly_partition(&mut db, &t, d(2024, 7, 14)).unwrap().name,
            "events_2024_w28"
        );
        assert_eq!(
            m.create_yearly_partition(&mut db, &t, d(2024, 7, 14)).unwrap().name,
            "events_2024"
        );
        assert!(db.sql_log()[1].ends_with("FOR VALUES FROM ('2024-07-08 00:00:00+00') TO ('2024-07-15 00:00:00+00')"));
        assert!(db.sql_log()[2].ends_with("FOR VALUES FROM ('2024-01-01 00:00:00+00') TO ('2025-01-01 00:00:00+00')"));
    }

    #[test]
    fn create_failure_names_partition() {
        let mut db = MockDatabase::new();
        db.on_error("CREATE TABLE", DbError::query("relation \"events\" does not exist"));
        let err = PartitionManager::new()
            .create_monthly_partition(&mut db, &ident("events"), d(2024, 7, 1))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "create partition events_2024_07: relation \"events\" does not exist"
        );
    }

    #[test]
    fn future_partitions_start_after_current_period() {
        let mut db = MockDatabase::new();
        let n = PartitionManager::new()
            .create_future_partitions_at(
                &mut db,
                &ident("events"),
                Granularity::Monthly,
                3,
                utc(2024, 11, 20),
            )
            .unwrap();
        assert_eq!(n, 3);
        let names: Vec<_> = db
            .sql_log()
            .iter()
            .map(|s| s.split_whitespace().nth(5).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["events_2024_12", "events_2025_01", "events_2025_02"]);
    }

    #[test]
    fn future_partitions_tolerate_partial_failure() {
        let mut db = MockDatabase::new();
        db.on_error("events_2024_12", DbError::query("lock timeout"));
        let n = PartitionManager::new()
            .create_future_partitions_at(
                &mut db,
                &ident("events"),
                Granularity::Monthly,
                3,
                utc(2024, 11, 20),
            )
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn future_partitions_fail_when_nothing_created() {
        let mut db = MockDatabase::new();
        db.on_error("CREATE TABLE", DbError::query("permission denied"));
        let err = PartitionManager::new()
            .create_future_partitions_at(
                &mut db,
                &ident("events"),
                Granularity::Daily,
                2,
                utc(2024, 11, 20),
            )
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn drop_old_partitions_respects_cutoff() {
        let mut db = MockDatabase::new();
        // now = 2024-08-15, retention 90 days -> cutoff 2024-05-17.
        let mut rows = monthly_rows("events", &[(2024, 3), (2024, 4), (2024, 5), (2024, 6), (2024, 7), (2024, 8)]);
        rows.push(partition_row("events_2024_05_16", "2024-05-15", "2024-05-16"));
        rows.push(partition_row("events_2024_05_17", "2024-05-16", "2024-05-17"));
        db.on_query("FROM pg_inherits", rows);

        let dropped = PartitionManager::new()
            .drop_old_partitions_at(&mut db, &ident("events"), TimeDelta::days(90), utc(2024, 8, 15))
            .unwrap();

        let drops: Vec<_> = db
            .statements()
            .iter()
            .filter(|s| s.kind == StatementKind::Batch)
            .map(|s| s.sql.clone())
            .collect();
        assert_eq!(
            drops,
            vec![
                "DROP TABLE IF EXISTS \"public\".\"events_2024_03\"",
                "DROP TABLE IF EXISTS \"public\".\"events_2024_04\"",
                "DROP TABLE IF EXISTS \"public\".\"events_2024_05_16\"",
            ]
        );
        assert_eq!(dropped, 3);
    }

    #[test]
    fn drop_failure_is_logged_and_not_counted() {
        let mut db = MockDatabase::new();
        db.on_query("FROM pg_inherits", monthly_rows("events", &[(2024, 1), (2024, 2), (2024, 3)]));
        db.on_error("events_2024_02", DbError::query("lock timeout"));

        let dropped = PartitionManager::new()
            .drop_old_partitions_at(&mut db, &ident("events"), TimeDelta::days(30), utc(2024, 8, 15))
            .unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(db.count_matching("DROP TABLE"), 3);
    }

    #[test]
    fn unparseable_bounds_are_never_dropped() {
        let mut db = MockDatabase::new();
        db.on_query(
            "FROM pg_inherits",
            vec![
                Row::from_pairs([
                    ("schemaname", Value::from("public")),
                    ("partition_name", Value::from("events_default")),
                    ("bound", Value::from("DEFAULT")),
                    ("size_bytes", Value::from(0)),
                ]),
                partition_row("events_old", "MINVALUE", "garbage"),
            ],
        );
        let dropped = PartitionManager::new()
            .drop_old_partitions_at(&mut db, &ident("events"), TimeDelta::days(1), utc(2024, 8, 15))
            .unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(db.count_matching("DROP TABLE"), 0);
    }

    #[test]
    fn drop_rejects_non_positive_retention() {
        let mut db = MockDatabase::new();
        let err = PartitionManager::new()
            .drop_old_partitions_at(&mut db, &ident("events"), TimeDelta::zero(), utc(2024, 8, 15))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(db.statements().is_empty());
    }

    #[test]
    fn listed_partitions_are_contiguous() {
        let mut db = MockDatabase::new();
        db.on_query("FROM pg_inherits", monthly_rows("events", &[(2024, 12), (2024, 11), (2025, 1)]));
        db.on_query("COUNT(*)", vec![Row::from_pairs([("n", Value::from(10))])]);

        let parts = PartitionManager::new()
            .get_partitions(&mut db, &ident("events"))
            .unwrap();
        assert_eq!(parts.len(), 3);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].range_end, pair[1].range_start);
        }
        assert_eq!(db.count_matching("COUNT(*)"), 3);
        assert!(parts.iter().all(|p| p.row_count == 10));
    }

    #[test]
    fn partition_stats_roll_up() {
        let mut db = MockDatabase::new();
        db.on_query("FROM pg_inherits", monthly_rows("events", &[(2024, 6), (2024, 7)]));
        db.on_query("COUNT(*)", vec![Row::from_pairs([("n", Value::from(250))])]);
        let stats = PartitionManager::new()
            .get_partition_stats(&mut db, &ident("events"))
            .unwrap();
        assert_eq!(stats.partition_count, 2);
        assert_eq!(stats.total_rows, 500);
        assert_eq!(stats.total_size_bytes, 16384);
        assert_eq!(stats.oldest_start, Some(utc(2024, 6, 1)));
        assert_eq!(stats.newest_end, Some(utc(2024, 8, 1)));
    }

    #[test]
    fn setup_creates_partitioned_copy_and_partitions() {
        let mut db = MockDatabase::new();
        let config = PartitionConfig::new(ident("transactions"), ident("created_at"), Granularity::Monthly);
        let setup = PartitionManager::new()
            .setup_partitioning(&mut db, &config, utc(2024, 7, 10))
            .unwrap();

        assert!(setup.created_table);
        assert_eq!(setup.target.as_str(), "transactions_partitioned");
        let names: Vec<_> = setup.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "transactions_partitioned_2024_07",
                "transactions_partitioned_2024_08",
                "transactions_partitioned_2024_09",
                "transactions_partitioned_2024_10",
            ]
        );
        assert_eq!(setup.partitions[0].range_start, Some(utc(2024, 7, 1)));
        assert_eq!(setup.partitions[0].range_end, Some(utc(2024, 8, 1)));

        let log = db.sql_log();
        assert_eq!(
            log[1],
            "SELECT MIN(created_at)::text AS oldest, MAX(created_at)::text AS newest FROM transactions"
        );
        assert_eq!(log[2], "BEGIN");
        assert_eq!(
            log[3],
            "CREATE TABLE IF NOT EXISTS transactions_partitioned \
             (LIKE transactions INCLUDING DEFAULTS INCLUDING CONSTRAINTS) \
             PARTITION BY RANGE (created_at)"
        );
        assert_eq!(log.last(), Some(&"COMMIT"));
        assert!(db.statements()[3..log.len() - 1].iter().all(|s| s.in_transaction));
    }

    #[test]
    fn setup_covers_the_oldest_and_newest_source_rows() {
        let mut db = MockDatabase::new();
        db.on_query(
            "MIN(created_at)",
            vec![Row::from_pairs([
                ("oldest", Value::from("2024-03-02 10:15:00+02")),
                ("newest", Value::from("2024-08-14 23:59:59+00")),
            ])],
        );
        let config = PartitionConfig::new(ident("transactions"), ident("created_at"), Granularity::Monthly);
        let setup = PartitionManager::new()
            .setup_partitioning(&mut db, &config, utc(2024, 8, 15))
            .unwrap();

        let names: Vec<_> = setup.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"transactions_partitioned_2024_03"));
        assert_eq!(names.last(), Some(&"transactions_partitioned_2024_11"));
        assert_eq!(names.len(), 9);
        assert!(setup.partitions[0].range_start <= Some(utc(2024, 3, 2)));
        for pair in setup.partitions.windows(2) {
            assert_eq!(pair[0].range_end, pair[1].range_start);
        }
    }

    #[test]
    fn setup_extends_past_lookahead_for_future_dated_rows() {
        let mut db = MockDatabase::new();
        db.on_query(
            "MIN(created_at)",
            vec![Row::from_pairs([
                ("oldest", Value::from("2024-07-20")),
                ("newest", Value::from("2025-01-03")),
            ])],
        );
        let config = PartitionConfig::new(ident("transactions"), ident("created_at"), Granularity::Monthly);
        let setup = PartitionManager::new()
            .with_lookahead(1)
            .setup_partitioning(&mut db, &config, utc(2024, 7, 10))
            .unwrap();
        assert_eq!(setup.partitions.len(), 7);
        assert_eq!(setup.partitions[6].name, "transactions_partitioned_2025_01");
    }

    #[test]
    fn setup_is_idempotent_for_existing_target() {
        let mut db = MockDatabase::new();
        db.on_query("pg_partitioned_table", vec![Row::from_pairs([("partitioned", Value::from(1))])]);
        let config = PartitionConfig::new(ident("transactions"), ident("created_at"), Granularity::Monthly);
        let setup = PartitionManager::new()
            .with_lookahead(1)
            .setup_partitioning(&mut db, &config, utc(2024, 7, 10))
            .unwrap();
        assert!(!setup.created_table);
        assert_eq!(setup.partitions.len(), 2);
        assert_eq!(db.count_matching("PARTITION BY RANGE"), 0);
    }

    #[test]
    fn setup_rolls_back_on_failure() {
        let mut db = MockDatabase::new();
        db.on_error("transactions_partitioned_2024_08", DbError::query("disk full"));
        let config = PartitionConfig::new(ident("transactions"), ident("created_at"), Granularity::Monthly);
        let err = PartitionManager::new()
            .setup_partitioning(&mut db, &config, utc(2024, 7, 10))
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(db.sql_log().last(), Some(&"ROLLBACK"));
    }

    #[test]
    fn setup_rejects_non_range_strategy() {
        let mut db = MockDatabase::new();
        let mut config = PartitionConfig::new(ident("t"), ident("c"), Granularity::Daily);
        config.strategy = PartitionStrategy::Hash;
        assert!(PartitionManager::new()
            .setup_partitioning(&mut db, &config, utc(2024, 7, 10))
            .is_err());
    }

    #[test]
    fn swap_renames_in_one_transaction() {
        let mut db = MockDatabase::new();
        db.with_handler(|sql, params| {
            (sql.contains("pg_partitioned_table")
                && params.first() == Some(&Value::from("public.transactions_partitioned")))
            .then(|| Ok(Reply::Rows(vec![Row::from_pairs([("partitioned", Value::from(1))])])))
        });
        let legacy = PartitionManager::new()
            .swap_in_partitioned(&mut db, &ident("public.transactions"))
            .unwrap();
        assert_eq!(legacy.as_str(), "public.transactions_legacy");
        assert_eq!(
            &db.sql_log()[1..],
            &[
                "BEGIN",
                "ALTER TABLE public.transactions RENAME TO transactions_legacy",
                "ALTER TABLE public.transactions_partitioned RENAME TO transactions",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn swap_requires_partitioned_target() {
        let mut db = MockDatabase::new();
        let err = PartitionManager::new()
            .swap_in_partitioned(&mut db, &ident("transactions"))
            .unwrap_err();
        assert!(err.to_string().contains("not a partitioned table"));
        assert_eq!(db.count_matching("RENAME"), 0);
    }

    #[test]
    fn detach_and_attach() {
        let mut db = MockDatabase::new();
        let m = PartitionManager::new();
        m.detach_partition(&mut db, &ident("events"), &ident("events_2024_01"))
            .unwrap();
        m.attach_partition(&mut db, &ident("events"), &ident("events_2024_01"), d(2024, 1, 1), d(2024, 2, 1))
            .unwrap();
        assert_eq!(
            db.sql_log(),
            vec![
                "ALTER TABLE events DETACH PARTITION events_2024_01",
                "ALTER TABLE events ATTACH PARTITION events_2024_01 \
                 FOR VALUES FROM ('2024-01-01 00:00:00+00') TO ('2024-02-01 00:00:00+00')",
            ]
        );
        assert!(m
            .attach_partition(&mut db, &ident("events"), &ident("x"), d(2024, 2, 1), d(2024, 2, 1))
            .is_err());
    }

    #[test]
    fn config_from_spec_string() {
        let c: PartitionConfig = "events:created_at:monthly:90d".parse().unwrap();
        assert_eq!(c.table.as_str(), "events");
        assert_eq!(c.column.as_str(), "created_at");
        assert_eq!(c.granularity, Granularity::Monthly);
        assert_eq!(c.retention, TimeDelta::days(90));

        let c: PartitionConfig = "logs:ts:daily".parse().unwrap();
        assert!(!c.has_retention());

        assert!("events:created_at".parse::<PartitionConfig>().is_err());
        assert!("Events:created_at:monthly".parse::<PartitionConfig>().is_err());
        assert!("events:created_at:hourly".parse::<PartitionConfig>().is_err());
        assert!("events:created_at:monthly:soon".parse::<PartitionConfig>().is_err());
    }
}
