//! SQL builders for PostgreSQL statistics views.

/// Wraps `query` in `EXPLAIN (ANALYZE, COSTS, VERBOSE, BUFFERS, FORMAT JSON)`.
pub(super) fn build_explain_query(query: &str) -> String {
    format!("EXPLAIN (ANALYZE, COSTS, VERBOSE, BUFFERS, FORMAT JSON) {query}")
}

/// Builds query for per-index usage from pg_stat_user_indexes.
///
/// `$1` is a schema name; an empty string matches every schema.
pub(super) fn build_index_usage_query() -> &'static str {
    r#"
        SELECT
            COALESCE(i.schemaname, '')::text as schemaname,
            COALESCE(i.relname, '')::text as relname,
            COALESCE(i.indexrelname, '')::text as indexrelname,
            COALESCE(i.idx_scan, 0)::bigint as idx_scan,
            COALESCE(i.idx_tup_read, 0)::bigint as idx_tup_read,
            COALESCE(i.idx_tup_fetch, 0)::bigint as idx_tup_fetch,
            COALESCE(pg_relation_size(i.indexrelid), 0)::bigint as size_bytes,
            COALESCE(x.indisprimary, false) as is_primary,
            COALESCE(x.indisunique, false) as is_unique
        FROM pg_stat_user_indexes i
        LEFT JOIN pg_index x ON x.indexrelid = i.indexrelid
        WHERE $1::text = '' OR i.schemaname = $1::text
        ORDER BY COALESCE(i.idx_scan, 0) DESC, i.schemaname, i.relname, i.indexrelname
    "#
}

/// Builds query for indexes that have never been scanned.
///
/// Primary-key and unique indexes are excluded both by the `_pkey`/`_unique`
/// naming convention and by the catalog flags.
pub(super) fn build_unused_indexes_query() -> &'static str {
    r#"
        SELECT
            COALESCE(i.schemaname, '')::text as schemaname,
            COALESCE(i.relname, '')::text as relname,
            COALESCE(i.indexrelname, '')::text as indexrelname,
            COALESCE(i.idx_scan, 0)::bigint as idx_scan,
            COALESCE(i.idx_tup_read, 0)::bigint as idx_tup_read,
            COALESCE(i.idx_tup_fetch, 0)::bigint as idx_tup_fetch,
            COALESCE(pg_relation_size(i.indexrelid), 0)::bigint as size_bytes,
            COALESCE(x.indisprimary, false) as is_primary,
            COALESCE(x.indisunique, false) as is_unique
        FROM pg_stat_user_indexes i
        LEFT JOIN pg_index x ON x.indexrelid = i.indexrelid
        WHERE COALESCE(i.idx_scan, 0) = 0
          AND i.indexrelname NOT LIKE '%\_pkey'
          AND i.indexrelname NOT LIKE '%\_unique'
          AND NOT COALESCE(x.indisprimary, false)
          AND NOT COALESCE(x.indisunique, false)
        ORDER BY pg_relation_size(i.indexrelid) DESC
    "#
}

/// Builds query listing plain-column indexes with their ordered column list.
///
/// Expression indexes are skipped. Key columns, INCLUDE columns, access
/// method and partial-index predicate are returned separately so only
/// indexes agreeing on all of them are reported as duplicates.
pub(super) fn build_index_columns_query() -> &'static str {
    r#"
        SELECT
            n.nspname::text as schemaname,
            t.relname::text as relname,
            c.relname::text as indexrelname,
            array_to_string(ARRAY(
                SELECT a.attname::text
                FROM unnest(x.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = x.indrelid AND a.attnum = k.attnum
                WHERE k.ord <= x.indnkeyatts
                ORDER BY k.ord
            ), ',') as columns,
            array_to_string(ARRAY(
                SELECT a.attname::text
                FROM unnest(x.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = x.indrelid AND a.attnum = k.attnum
                WHERE k.ord > x.indnkeyatts
                ORDER BY k.ord
            ), ',') as include_columns,
            am.amname::text as method,
            COALESCE(pg_get_expr(x.indpred, x.indrelid), '')::text as predicate,
            COALESCE(s.idx_scan, 0)::bigint as idx_scan,
            COALESCE(s.idx_tup_read, 0)::bigint as idx_tup_read,
            COALESCE(s.idx_tup_fetch, 0)::bigint as idx_tup_fetch,
            COALESCE(pg_relation_size(x.indexrelid), 0)::bigint as size_bytes,
            x.indisprimary as is_primary,
            x.indisunique as is_unique
        FROM pg_index x
        JOIN pg_class c ON c.oid = x.indexrelid
        JOIN pg_am am ON am.oid = c.relam
        JOIN pg_class t ON t.oid = x.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        LEFT JOIN pg_stat_user_indexes s ON s.indexrelid = x.indexrelid
        WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
          AND n.nspname NOT LIKE 'pg\_toast%'
          AND x.indexprs IS NULL
        ORDER BY n.nspname, t.relname, c.relname
    "#
}

/// Builds version-aware query for the slowest or most frequent statements.
///
/// `order_by` must be one of the fixed column aliases of the select list.
/// `$1` is the row limit. Statements touching pg_stat_statements itself are
/// excluded.
pub(super) fn build_query_stats_query(server_version_num: Option<i32>, order_by: &str) -> String {
    let v = server_version_num.unwrap_or(0);
    let (total, mean, min, max, stddev) = if v >= 130000 {
        (
            "s.total_exec_time",
            "s.mean_exec_time",
            "s.min_exec_time",
            "s.max_exec_time",
            "s.stddev_exec_time",
        )
    } else {
        (
            "s.total_time",
            "s.mean_time",
            "s.min_time",
            "s.max_time",
            "s.stddev_time",
        )
    };

    format!(
        r#"
            SELECT
                s.queryid::bigint as queryid,
                COALESCE(s.query, '')::text as query,
                s.calls::bigint as calls,
                {total}::double precision as total_exec_time,
                {mean}::double precision as mean_exec_time,
                {min}::double precision as min_exec_time,
                {max}::double precision as max_exec_time,
                {stddev}::double precision as stddev_exec_time,
                s.rows::bigint as rows,
                s.shared_blks_hit::bigint as shared_blks_hit,
                s.shared_blks_read::bigint as shared_blks_read,
                COALESCE(
                    100.0 * s.shared_blks_hit / NULLIF(s.shared_blks_hit + s.shared_blks_read, 0),
                    0
                )::double precision as cache_hit_ratio
            FROM pg_stat_statements s
            WHERE s.query NOT ILIKE '%pg_stat_statements%'
            ORDER BY {order_by} DESC
            LIMIT $1
        "#
    )
}

pub(super) fn build_reset_query_stats_query() -> &'static str {
    "SELECT pg_stat_statements_reset()"
}

/// Builds query for pg_stat_user_tables.
pub(super) fn build_table_stats_query() -> &'static str {
    r#"
        SELECT
            COALESCE(schemaname, '')::text as schemaname,
            COALESCE(relname, '')::text as relname,
            COALESCE(seq_scan, 0)::bigint as seq_scan,
            COALESCE(seq_tup_read, 0)::bigint as seq_tup_read,
            COALESCE(idx_scan, 0)::bigint as idx_scan,
            COALESCE(idx_tup_fetch, 0)::bigint as idx_tup_fetch,
            COALESCE(n_tup_ins, 0)::bigint as n_tup_ins,
            COALESCE(n_tup_upd, 0)::bigint as n_tup_upd,
            COALESCE(n_tup_del, 0)::bigint as n_tup_del,
            COALESCE(n_live_tup, 0)::bigint as n_live_tup,
            COALESCE(n_dead_tup, 0)::bigint as n_dead_tup,
            last_vacuum,
            last_autovacuum,
            last_analyze,
            last_autoanalyze,
            COALESCE(pg_total_relation_size(relid), 0)::bigint as size_bytes
        FROM pg_stat_user_tables
        ORDER BY COALESCE(n_live_tup, 0) DESC
    "#
}

pub(super) fn build_extension_check_query() -> &'static str {
    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'"
}
