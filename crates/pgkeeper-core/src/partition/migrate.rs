//! Batched copy of an unpartitioned table into its partitioned replacement.

use serde::Serialize;
use tracing::info;

use super::PartitionManager;
use crate::db::{Database, Executor, Value};
use crate::error::{DbResultExt, Error, Result};
use crate::ident::Ident;

/// Table holding per-(source, target) migration progress.
pub const CHECKPOINT_TABLE: &str = "pgkeeper_migration_checkpoints";

const DEFAULT_BATCH_SIZE: i64 = 10_000;

fn build_checkpoint_table_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (\
         source text NOT NULL, \
         target text NOT NULL, \
         migrated_rows bigint NOT NULL, \
         updated_at timestamptz NOT NULL DEFAULT now(), \
         PRIMARY KEY (source, target))"
    )
}

fn build_checkpoint_read_query() -> String {
    format!("SELECT migrated_rows FROM {CHECKPOINT_TABLE} WHERE source = $1 AND target = $2")
}

fn build_checkpoint_upsert() -> String {
    format!(
        "INSERT INTO {CHECKPOINT_TABLE} (source, target, migrated_rows, updated_at) \
         VALUES ($1, $2, $3, now()) \
         ON CONFLICT (source, target) DO UPDATE \
         SET migrated_rows = EXCLUDED.migrated_rows, updated_at = EXCLUDED.updated_at"
    )
}

/// Options for [`PartitionManager::migrate_to_partitioned`].
#[derive(Clone, Debug)]
pub struct MigrationOptions {
    /// Rows per `INSERT ... SELECT`. Default: 10000.
    pub batch_size: i64,
    /// Column giving the copy its order. Default: `created_at`. Ties are
    /// broken by `ctid`, so batch boundaries do not depend on the plan.
    pub order_by: Ident,
    /// Persist progress after every batch and resume from it. Default: true.
    ///
    /// Without a checkpoint each batch commits on its own and a failed run
    /// leaves a partially copied target with nothing recording how far it got.
    pub checkpoint: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            order_by: Ident::from_static("created_at"),
            checkpoint: true,
        }
    }
}

/// Outcome of a migration run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationReport {
    pub source: String,
    pub target: String,
    /// Rows in the source when the run started.
    pub total_rows: i64,
    /// Offset the run started from; non-zero when resumed from a checkpoint.
    pub resumed_from: i64,
    /// Rows copied by this run.
    pub migrated_rows: i64,
    pub batches: u32,
}

impl PartitionManager {
    /// Copies `source` into `target` in batches ordered by
    /// [`MigrationOptions::order_by`], until a batch comes back short.
    ///
    /// With checkpointing each batch and its checkpoint commit together, so
    /// rerunning after a failure continues where the last committed batch
    /// ended. Rows written to `source` during the run may be missed or, if
    /// they sort before the current offset, shift later rows.
    pub fn migrate_to_partitioned<D: Database + ?Sized>(
        &self,
        db: &mut D,
        source: &Ident,
        target: &Ident,
        options: &MigrationOptions,
    ) -> Result<MigrationReport> {
        if options.batch_size <= 0 {
            return Err(Error::InvalidArgument(format!(
                "batch size must be positive, got {}",
                options.batch_size
            )));
        }

        let total: i64 = db
            .query_one(&format!("SELECT COUNT(*)::bigint AS n FROM {source}"), &[])
            .and_then(|row| row.try_get("n"))
            .during(format!("count rows of {source}"))?;

        let mut offset = 0;
        if options.checkpoint {
            offset = read_checkpoint(db, source, target)?;
            if offset > 0 {
                info!(%source, %target, offset, total, "resuming migration from checkpoint");
            }
        }
        let resumed_from = offset;

        let insert = format!(
            "INSERT INTO {target} SELECT * FROM {source} ORDER BY {order_by}, ctid LIMIT $1 OFFSET $2",
            order_by = options.order_by
        );
        let mut batches = 0;
        loop {
            let moved = copy_batch(db, &insert, source, target, offset, options).map_err(|e| {
                Error::Migration {
                    source_table: source.to_string(),
                    target_table: target.to_string(),
                    migrated: offset,
                    source: Box::new(e),
                }
            })?;
            batches += 1;
            offset += moved;

            let progress = if total > 0 {
                (offset as f64 / total as f64 * 100.0).min(100.0)
            } else {
                100.0
            };
            info!(
                %source,
                %target,
                migrated = offset,
                total,
                percent = (progress * 10.0).round() / 10.0,
                "migration batch done"
            );

            if moved < options.batch_size {
                break;
            }
        }

        Ok(MigrationReport {
            source: source.to_string(),
            target: target.to_string(),
            total_rows: total,
            resumed_from,
            migrated_rows: offset - resumed_from,
            batches,
        })
    }

    /// Forgets the checkpoint of `source -> target` so the next run starts over.
    pub fn clear_migration_checkpoint<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        source: &Ident,
        target: &Ident,
    ) -> Result<bool> {
        db.batch_execute(&build_checkpoint_table_ddl())
            .during("create checkpoint table")?;
        let n = db
            .execute(
                &format!("DELETE FROM {CHECKPOINT_TABLE} WHERE source = $1 AND target = $2"),
                &[Value::from(source.as_str()), Value::from(target.as_str())],
            )
            .during("clear checkpoint")?;
        Ok(n > 0)
    }
}

fn read_checkpoint<E: Executor + ?Sized>(db: &mut E, source: &Ident, target: &Ident) -> Result<i64> {
    db.batch_execute(&build_checkpoint_table_ddl())
        .during("create checkpoint table")?;
    let row = db
        .query_opt(
            &build_checkpoint_read_query(),
            &[Value::from(source.as_str()), Value::from(target.as_str())],
        )
        .during("read checkpoint")?;
    match row {
        Some(row) => row.try_get("migrated_rows").during("read checkpoint"),
        None => Ok(0),
    }
}

/// Copies one batch. Returns the number of rows inserted.
fn copy_batch<D: Database + ?Sized>(
    db: &mut D,
    insert: &str,
    source: &Ident,
    target: &Ident,
    offset: i64,
    options: &MigrationOptions,
) -> Result<i64> {
    let params = [Value::from(options.batch_size), Value::from(offset)];
    if !options.checkpoint {
        let n = db.execute(insert, &params).during("copy batch")?;
        return Ok(n as i64);
    }

    let mut tx = db.transaction().during("begin batch")?;
    let n = tx.execute(insert, &params).during("copy batch")? as i64;
    tx.execute(
        &build_checkpoint_upsert(),
        &[
            Value::from(source.as_str()),
            Value::from(target.as_str()),
            Value::from(offset + n),
        ],
    )
    .during("write checkpoint")?;
    tx.commit().during("commit batch")?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use crate::db::mock::{MockDatabase, Reply, StatementKind};
    use crate::error::DbError;

    fn ident(s: &str) -> Ident {
        Ident::new(s).unwrap()
    }

    /// Mock whose `events` table holds `rows` rows.
    fn source_of(rows: i64) -> MockDatabase {
        let mut db = MockDatabase::new();
        db.with_handler(move |sql, params| {
            if sql.starts_with("SELECT COUNT(*)") {
                return Some(Ok(Reply::Rows(vec![Row::from_pairs([("n", Value::from(rows))])])));
            }
            if sql.starts_with("INSERT INTO events_partitioned") {
                let (Value::Int(limit), Value::Int(offset)) = (&params[0], &params[1]) else {
                    return Some(Err(DbError::query("bad params")));
                };
                let n = (rows - offset).clamp(0, *limit);
                return Some(Ok(Reply::Affected(n as u64)));
            }
            None
        });
        db
    }

    fn options(batch_size: i64) -> MigrationOptions {
        MigrationOptions {
            batch_size,
            ..Default::default()
        }
    }

    fn checkpoint_values(db: &MockDatabase) -> Vec<Value> {
        db.statements()
            .iter()
            .filter(|s| s.sql.starts_with(&format!("INSERT INTO {CHECKPOINT_TABLE}")))
            .map(|s| s.params[2].clone())
            .collect()
    }

    #[test]
    fn copies_in_batches_until_short_batch() {
        let mut db = source_of(25);
        let report = PartitionManager::new()
            .migrate_to_partitioned(&mut db, &ident("events"), &ident("events_partitioned"), &options(10))
            .unwrap();

        assert_eq!(report.total_rows, 25);
        assert_eq!(report.migrated_rows, 25);
        assert_eq!(report.batches, 3);
        assert_eq!(
            checkpoint_values(&db),
            vec![Value::from(10i64), Value::from(20i64), Value::from(25i64)]
        );

        let copies: Vec<_> = db
            .statements()
            .iter()
            .filter(|s| s.sql.starts_with("INSERT INTO events_partitioned"))
            .collect();
        assert_eq!(
            copies[0].sql,
            "INSERT INTO events_partitioned SELECT * FROM events ORDER BY created_at, ctid LIMIT $1 OFFSET $2"
        );
        assert_eq!(copies[2].params, vec![Value::from(10i64), Value::from(20i64)]);
        assert!(copies.iter().all(|s| s.in_transaction));
        assert_eq!(db.count_matching("COMMIT"), 3);
    }

    #[test]
    fn exact_multiple_needs_one_empty_batch() {
        let mut db = source_of(20);
        let report = PartitionManager::new()
            .migrate_to_partitioned(&mut db, &ident("events"), &ident("events_partitioned"), &options(10))
            .unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.migrated_rows, 20);
    }

    #[test]
    fn resumes_from_checkpoint() {
        let mut db = source_of(25);
        db.on_query(
            "SELECT migrated_rows",
            vec![Row::from_pairs([("migrated_rows", Value::from(20i64))])],
        );
        let report = PartitionManager::new()
            .migrate_to_partitioned(&mut db, &ident("events"), &ident("events_partitioned"), &options(10))
            .unwrap();
        assert_eq!(report.resumed_from, 20);
        assert_eq!(report.migrated_rows, 5);
        assert_eq!(report.batches, 1);
        assert_eq!(checkpoint_values(&db), vec![Value::from(25i64)]);
    }

    #[test]
    fn failure_reports_progress_and_rolls_back_batch() {
        let mut db = source_of(25);
        // Second checkpoint write fails.
        db.on_query_once("INSERT INTO pgkeeper_migration_checkpoints", vec![]);
        db.on_error("INSERT INTO pgkeeper_migration_checkpoints", DbError::query("disk full"));

        let err = PartitionManager::new()
            .migrate_to_partitioned(&mut db, &ident("events"), &ident("events_partitioned"), &options(10))
            .unwrap_err();
        match &err {
            Error::Migration { migrated, .. } => assert_eq!(*migrated, 10),
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("stopped after 10 rows"));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(db.sql_log().last(), Some(&"ROLLBACK"));
    }

    #[test]
    fn without_checkpoint_runs_plain_statements() {
        let mut db = source_of(15);
        let opts = MigrationOptions {
            batch_size: 10,
            checkpoint: false,
            ..Default::default()
        };
        let report = PartitionManager::new()
            .migrate_to_partitioned(&mut db, &ident("events"), &ident("events_partitioned"), &opts)
            .unwrap();
        assert_eq!(report.migrated_rows, 15);
        assert_eq!(db.count_matching(CHECKPOINT_TABLE), 0);
        assert!(db.statements().iter().all(|s| s.kind != StatementKind::Begin));
    }

    #[test]
    fn rejects_bad_batch_size() {
        let mut db = source_of(15);
        let err = PartitionManager::new()
            .migrate_to_partitioned(&mut db, &ident("events"), &ident("events_partitioned"), &options(0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn clear_checkpoint_deletes_row() {
        let mut db = MockDatabase::new();
        db.on_execute("DELETE FROM pgkeeper_migration_checkpoints", 1);
        let cleared = PartitionManager::new()
            .clear_migration_checkpoint(&mut db, &ident("events"), &ident("events_partitioned"))
            .unwrap();
        assert!(cleared);
    }
}
