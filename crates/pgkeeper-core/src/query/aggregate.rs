//! Grouped and time-bucketed aggregation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Diagnostics;
use super::filter::{Conditions, Filter};
use crate::db::{Executor, FromValue, Row, Value};
use crate::error::{Error, Result};
use crate::ident::{Aggregate, Ident, Interval};

/// One bucket of a time series.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimeSeriesDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub count: i64,
}

/// Parameters of [`aggregate_by_interval`]. The range is `[start, end)`.
#[derive(Clone, Debug)]
pub struct TimeSeriesQuery {
    pub table: Ident,
    pub time_column: Ident,
    pub value_column: Ident,
    pub aggregate: Aggregate,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub filters: Vec<Filter>,
}

pub(crate) fn group_sql(
    table: &Ident,
    group_column: &Ident,
    aggregate: &str,
    filters: &[Filter],
) -> (String, Vec<Value>) {
    let mut c = Conditions::new();
    c.push_filters(filters);
    (
        format!(
            "SELECT {group_column}::text AS group_key, {aggregate} AS total \
             FROM {table}{} GROUP BY {group_column}",
            c.where_sql()
        ),
        c.params,
    )
}

/// `SUM(sum_column)` per distinct value of `group_column`.
///
/// Keys are the text form of the group value; SQL NULL groups under `"NULL"`.
pub(crate) fn sum_by_group<E: Executor + ?Sized>(
    db: &mut E,
    diagnostics: &Diagnostics,
    table: &Ident,
    group_column: &Ident,
    sum_column: &Ident,
    filters: &[Filter],
) -> Result<BTreeMap<String, f64>> {
    let (sql, params) = group_sql(
        table,
        group_column,
        &format!("COALESCE(SUM({sum_column}), 0)::double precision"),
        filters,
    );
    collect_groups(diagnostics.query(db, "sum by group", &sql, &params)?)
}

/// Row count per distinct value of `group_column`.
pub(crate) fn count_by_group<E: Executor + ?Sized>(
    db: &mut E,
    diagnostics: &Diagnostics,
    table: &Ident,
    group_column: &Ident,
    filters: &[Filter],
) -> Result<BTreeMap<String, i64>> {
    let (sql, params) = group_sql(table, group_column, "COUNT(*)::bigint", filters);
    collect_groups(diagnostics.query(db, "count by group", &sql, &params)?)
}

fn collect_groups<T: FromValue>(rows: Vec<Row>) -> Result<BTreeMap<String, T>> {
    let mut out = BTreeMap::new();
    for row in rows {
        let key = row.value("group_key")?.to_key_string();
        out.insert(key, row.try_get("total")?);
    }
    Ok(out)
}

pub(crate) fn interval_sql(q: &TimeSeriesQuery) -> (String, Vec<Value>) {
    let mut c = Conditions::new();
    let start = c.bind(Value::Timestamp(q.start));
    let end = c.bind(Value::Timestamp(q.end));
    c.push_clause(format!("{} >= {start}", q.time_column));
    c.push_clause(format!("{} < {end}", q.time_column));
    c.push_filters(&q.filters);
    let bucket = format!("date_trunc('{}', {})", q.interval.as_sql(), q.time_column);
    (
        format!(
            "SELECT {bucket} AS bucket, \
             COALESCE({}({}), 0)::double precision AS value, \
             COUNT(*)::bigint AS count \
             FROM {}{} GROUP BY {bucket} ORDER BY bucket",
            q.aggregate.as_sql(),
            q.value_column,
            q.table,
            c.where_sql()
        ),
        c.params,
    )
}

/// Buckets rows by `date_trunc(interval, time_column)` and aggregates
/// `value_column` per bucket. Empty buckets are absent from the result.
pub(crate) fn aggregate_by_interval<E: Executor + ?Sized>(
    db: &mut E,
    diagnostics: &Diagnostics,
    q: &TimeSeriesQuery,
) -> Result<Vec<TimeSeriesDataPoint>> {
    if q.start >= q.end {
        return Err(Error::InvalidArgument(format!(
            "empty time range {} .. {}",
            q.start, q.end
        )));
    }
    let (sql, params) = interval_sql(q);
    diagnostics
        .query(db, "aggregate by interval", &sql, &params)?
        .iter()
        .map(|row| -> Result<TimeSeriesDataPoint> {
            Ok(TimeSeriesDataPoint {
                timestamp: row.try_get("bucket")?,
                value: row.try_get("value")?,
                count: row.try_get("count")?,
            })
        })
        .collect()
}
