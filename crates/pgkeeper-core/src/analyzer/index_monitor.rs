//! Index usage monitoring over pg_stat_user_indexes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::queries::{
    build_index_columns_query, build_index_usage_query, build_unused_indexes_query,
};
use crate::cache::TtlCache;
use crate::db::{Executor, Row, Value};
use crate::error::{DbError, DbResultExt, Result};

/// Default lifetime of a cached index snapshot.
pub const DEFAULT_INDEX_SCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);

const MIB: f64 = 1024.0 * 1024.0;
/// Indexes larger than this with fewer than one scan per MiB are called out.
const LOW_USAGE_MIN_SIZE: i64 = 10 * 1024 * 1024;

/// Usage statistics of one index.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IndexUsageStats {
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub idx_scan: i64,
    pub idx_tup_read: i64,
    pub idx_tup_fetch: i64,
    pub size_bytes: i64,
    /// Scans per MiB of index size.
    pub usage_ratio: f64,
    pub is_unused: bool,
    pub is_duplicate: bool,
    #[serde(skip)]
    pub is_primary: bool,
    #[serde(skip)]
    pub is_unique: bool,
    pub recommendation: String,
}

impl IndexUsageStats {
    fn from_row(row: &Row) -> std::result::Result<Self, DbError> {
        let mut stats = IndexUsageStats {
            schema_name: row.try_get("schemaname")?,
            table_name: row.try_get("relname")?,
            index_name: row.try_get("indexrelname")?,
            idx_scan: row.try_get("idx_scan")?,
            idx_tup_read: row.try_get("idx_tup_read")?,
            idx_tup_fetch: row.try_get("idx_tup_fetch")?,
            size_bytes: row.try_get("size_bytes")?,
            is_primary: row.try_get::<_, Option<bool>>("is_primary")?.unwrap_or(false),
            is_unique: row.try_get::<_, Option<bool>>("is_unique")?.unwrap_or(false),
            ..Default::default()
        };
        stats.usage_ratio = usage_ratio(stats.idx_scan, stats.size_bytes);
        stats.is_unused = stats.idx_scan == 0;
        stats.recommendation = recommend(&stats);
        Ok(stats)
    }

    /// True for indexes that back a primary key or unique constraint.
    pub fn is_constraint_backed(&self) -> bool {
        self.is_primary || self.is_unique || is_constraint_name(&self.index_name)
    }
}

/// Scans per MiB. A zero-sized index reports its raw scan count.
pub fn usage_ratio(idx_scan: i64, size_bytes: i64) -> f64 {
    if size_bytes <= 0 {
        return idx_scan as f64;
    }
    idx_scan as f64 / (size_bytes as f64 / MIB)
}

/// Naming convention for constraint-backed indexes.
pub fn is_constraint_name(index_name: &str) -> bool {
    index_name.ends_with("_pkey") || index_name.ends_with("_unique")
}

fn recommend(s: &IndexUsageStats) -> String {
    if s.is_unused {
        if s.is_constraint_backed() {
            return "never scanned, but enforces a constraint; keep".to_string();
        }
        return format!(
            "never scanned; consider DROP INDEX {}.{} to reclaim {:.1} MB",
            s.schema_name,
            s.index_name,
            s.size_bytes as f64 / MIB
        );
    }
    if s.size_bytes >= LOW_USAGE_MIN_SIZE && s.usage_ratio < 1.0 {
        return format!(
            "rarely used for its size ({:.2} scans/MB); verify it is still needed",
            s.usage_ratio
        );
    }
    String::new()
}

/// One index with its ordered column signature.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexDefinition {
    pub stats: IndexUsageStats,
    /// Key columns in index order.
    pub columns: Vec<String>,
    /// Non-key `INCLUDE` columns.
    pub include_columns: Vec<String>,
    /// Access method (`btree`, `hash`, `gin`, ...).
    pub method: String,
    pub predicate: String,
}

impl IndexDefinition {
    fn from_row(row: &Row) -> std::result::Result<Self, DbError> {
        let list = |name: &str| -> std::result::Result<Vec<String>, DbError> {
            let joined: String = row.try_get(name)?;
            Ok(joined
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect())
        };
        Ok(Self {
            stats: IndexUsageStats::from_row(row)?,
            columns: list("columns")?,
            include_columns: list("include_columns")?,
            method: row.try_get("method")?,
            predicate: row.try_get("predicate")?,
        })
    }
}

/// Groups indexes with the same table, access method, key column order,
/// INCLUDE columns and predicate.
///
/// Returns every member of every group with more than one member, flagged as
/// duplicate with a recommendation naming the others.
pub fn find_duplicates(defs: Vec<IndexDefinition>) -> Vec<IndexUsageStats> {
    type Signature = (String, String, String, String, String, String);
    let mut groups: BTreeMap<Signature, Vec<IndexUsageStats>> = BTreeMap::new();
    for def in defs {
        if def.columns.is_empty() {
            continue;
        }
        let key = (
            def.stats.schema_name.clone(),
            def.stats.table_name.clone(),
            def.method.clone(),
            def.columns.join(","),
            def.include_columns.join(","),
            def.predicate.clone(),
        );
        groups.entry(key).or_default().push(def.stats);
    }

    let mut out = Vec::new();
    for ((_, _, _, columns, _, _), members) in groups {
        if members.len() < 2 {
            continue;
        }
        let names: Vec<String> = members.iter().map(|m| m.index_name.clone()).collect();
        for mut m in members {
            let others: Vec<&str> = names
                .iter()
                .filter(|n| **n != m.index_name)
                .map(String::as_str)
                .collect();
            m.is_duplicate = true;
            m.recommendation = format!(
                "duplicate of {} on ({}); keep one",
                others.join(", "),
                columns
            );
            out.push(m);
        }
    }
    out
}

/// Configuration for [`IndexUsageMonitor`].
#[derive(Clone, Debug)]
pub struct IndexMonitorConfig {
    /// How long a snapshot is served from cache. Default: 1 hour.
    pub scan_interval: Duration,
}

impl Default for IndexMonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_INDEX_SCAN_INTERVAL,
        }
    }
}

/// Reports per-index usage, cached per schema scope.
#[derive(Debug)]
pub struct IndexUsageMonitor {
    cache: TtlCache<String, Vec<IndexUsageStats>>,
}

impl IndexUsageMonitor {
    pub fn new(config: IndexMonitorConfig) -> Self {
        Self {
            cache: TtlCache::new(config.scan_interval),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        self.cache.ttl()
    }

    /// Usage of every user index. Served from cache while fresh.
    pub fn stats<E: Executor + ?Sized>(&self, db: &mut E) -> Result<Vec<IndexUsageStats>> {
        self.stats_for_schema(db, "")
    }

    /// Usage of every index in `schema` (`""` for all schemas).
    pub fn stats_for_schema<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        schema: &str,
    ) -> Result<Vec<IndexUsageStats>> {
        self.cache.get_or_refresh(schema.to_string(), || {
            let rows = db
                .query(build_index_usage_query(), &[Value::from(schema)])
                .during("scan index usage")?;
            let stats = parse_rows(&rows, IndexUsageStats::from_row)?;
            debug!(schema, indexes = stats.len(), "index usage refreshed");
            Ok(stats)
        })
    }

    /// Drops cached snapshots so the next call rescans.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    /// Indexes with zero scans that do not back a primary key or unique
    /// constraint. Always reads fresh statistics.
    pub fn unused_indexes<E: Executor + ?Sized>(
        &self,
        db: &mut E,
    ) -> Result<Vec<IndexUsageStats>> {
        let rows = db
            .query(build_unused_indexes_query(), &[])
            .during("scan unused indexes")?;
        let stats = parse_rows(&rows, IndexUsageStats::from_row)?;
        Ok(stats
            .into_iter()
            .filter(|s| s.is_unused && !s.is_constraint_backed())
            .collect())
    }

    /// Indexes sharing table, column order and predicate with another index.
    pub fn duplicate_indexes<E: Executor + ?Sized>(
        &self,
        db: &mut E,
    ) -> Result<Vec<IndexUsageStats>> {
        let rows = db
            .query(build_index_columns_query(), &[])
            .during("scan index definitions")?;
        let defs = parse_rows(&rows, IndexDefinition::from_row)?;
        Ok(find_duplicates(defs))
    }
}

impl Default for IndexUsageMonitor {
    fn default() -> Self {
        Self::new(IndexMonitorConfig::default())
    }
}

fn parse_rows<T>(
    rows: &[Row],
    parse: impl Fn(&Row) -> std::result::Result<T, DbError>,
) -> Result<Vec<T>> {
    rows.iter()
        .map(parse)
        .collect::<std::result::Result<Vec<_>, _>>()
        .during("decode index statistics")
}
