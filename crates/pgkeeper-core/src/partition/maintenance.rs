//! Background loop keeping partitioned tables ahead of incoming data.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{DEFAULT_LOOKAHEAD, PartitionConfig, PartitionManager};
use crate::db::Database;
use crate::error::{Error, Result};

/// Default time between maintenance cycles.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Configuration for [`MaintenanceRunner`].
#[derive(Clone, Debug)]
pub struct MaintenanceConfig {
    pub tables: Vec<PartitionConfig>,
    /// Time between cycles. Default: 1 hour.
    pub interval: Duration,
    /// Future partitions ensured per table and cycle. Default: 3.
    pub lookahead: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            interval: DEFAULT_MAINTENANCE_INTERVAL,
            lookahead: DEFAULT_LOOKAHEAD,
        }
    }
}

/// What one cycle did to one table.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TableMaintenance {
    pub table: String,
    pub created: u32,
    pub dropped: u32,
    pub errors: Vec<String>,
}

/// Outcome of one maintenance cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub tables: Vec<TableMaintenance>,
}

impl MaintenanceReport {
    pub fn has_errors(&self) -> bool {
        self.tables.iter().any(|t| !t.errors.is_empty())
    }

    pub fn created(&self) -> u32 {
        self.tables.iter().map(|t| t.created).sum()
    }

    pub fn dropped(&self) -> u32 {
        self.tables.iter().map(|t| t.dropped).sum()
    }
}

/// Ensures future partitions and prunes expired ones for a set of tables.
///
/// Owns its connection. Run one cycle with [`run_once`], or move the runner
/// onto its own thread with [`start`].
///
/// Only one runner should manage a given table across all processes; the DDL
/// is idempotent but concurrent runners race.
///
/// [`run_once`]: MaintenanceRunner::run_once
/// [`start`]: MaintenanceRunner::start
pub struct MaintenanceRunner<D> {
    db: D,
    manager: PartitionManager,
    config: MaintenanceConfig,
}

impl<D: Database> MaintenanceRunner<D> {
    pub fn new(db: D, config: MaintenanceConfig) -> Self {
        Self {
            db,
            manager: PartitionManager::new().with_lookahead(config.lookahead),
            config,
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn into_database(self) -> D {
        self.db
    }

    /// Runs one cycle over every configured table.
    pub fn run_once(&mut self) -> MaintenanceReport {
        self.run_once_at(Utc::now())
    }

    /// Like [`run_once`](MaintenanceRunner::run_once) with an explicit clock.
    ///
    /// Errors are recorded per table; one failing table does not stop the
    /// others.
    pub fn run_once_at(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut tables = Vec::with_capacity(self.config.tables.len());
        for cfg in &self.config.tables {
            let mut result = TableMaintenance {
                table: cfg.table.to_string(),
                ..Default::default()
            };

            match self.manager.create_future_partitions_at(
                &mut self.db,
                &cfg.table,
                cfg.granularity,
                self.config.lookahead,
                now,
            ) {
                Ok(n) => result.created = n,
                Err(e) => {
                    error!(table = %cfg.table, error = %e, "failed to create future partitions");
                    result.errors.push(e.to_string());
                }
            }

            if cfg.has_retention() {
                match self
                    .manager
                    .drop_old_partitions_at(&mut self.db, &cfg.table, cfg.retention, now)
                {
                    Ok(n) => result.dropped = n,
                    Err(e) => {
                        error!(table = %cfg.table, error = %e, "failed to drop expired partitions");
                        result.errors.push(e.to_string());
                    }
                }
            }

            debug!(
                table = %cfg.table,
                created = result.created,
                dropped = result.dropped,
                "table maintained"
            );
            tables.push(result);
        }
        MaintenanceReport {
            started_at: now,
            tables,
        }
    }
}

impl<D: Database + Send + 'static> MaintenanceRunner<D> {
    /// Moves the runner onto a background thread.
    ///
    /// The first cycle runs immediately, then one per interval until the
    /// handle is stopped or dropped.
    pub fn start(self) -> Result<MaintenanceHandle<D>> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.config.interval;

        let thread = thread::Builder::new()
            .name("pgkeeper-maintenance".to_string())
            .spawn(move || {
                let mut runner = self;
                info!(
                    tables = runner.config.tables.len(),
                    interval_secs = interval.as_secs(),
                    "maintenance loop started"
                );
                loop {
                    let report = runner.run_once();
                    if report.has_errors() {
                        warn!(
                            created = report.created(),
                            dropped = report.dropped(),
                            "maintenance cycle finished with errors"
                        );
                    } else {
                        info!(
                            created = report.created(),
                            dropped = report.dropped(),
                            "maintenance cycle finished"
                        );
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("maintenance loop stopped");
                runner
            })
            .map_err(|source| Error::Spawn {
                name: "maintenance".to_string(),
                source,
            })?;

        Ok(MaintenanceHandle {
            stop: stop_tx,
            thread: Some(thread),
        })
    }
}

/// Signals a running maintenance loop to stop. Cheap to clone and `Send`,
/// for use from signal handlers.
#[derive(Clone, Debug)]
pub struct MaintenanceStopper(Sender<()>);

impl MaintenanceStopper {
    pub fn stop(&self) {
        // The loop may already be gone.
        let _ = self.0.send(());
    }
}

/// Handle to a running [`MaintenanceRunner`]. Dropping it stops the loop and
/// waits for the current cycle to finish.
pub struct MaintenanceHandle<D> {
    stop: Sender<()>,
    thread: Option<JoinHandle<MaintenanceRunner<D>>>,
}

impl<D> MaintenanceHandle<D> {
    pub fn stopper(&self) -> MaintenanceStopper {
        MaintenanceStopper(self.stop.clone())
    }

    /// Stops the loop and returns the runner. `None` if the loop panicked.
    pub fn stop(mut self) -> Option<MaintenanceRunner<D>> {
        let _ = self.stop.send(());
        self.thread.take().and_then(|t| t.join().ok())
    }

    /// Waits until a [`MaintenanceStopper`] stops the loop.
    pub fn join(mut self) -> Option<MaintenanceRunner<D>> {
        self.thread.take().and_then(|t| t.join().ok())
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl<D> Drop for MaintenanceHandle<D> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop.send(());
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDatabase;
    use crate::db::{Row, Value};
    use crate::error::DbError;
    use crate::ident::Ident;
    use crate::partition::Granularity;
    use chrono::{TimeDelta, TimeZone};

    fn config(spec: &str) -> PartitionConfig {
        spec.parse().unwrap()
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn cycle_creates_and_prunes_each_table() {
        let mut db = MockDatabase::new();
        db.on_query(
            "FROM pg_inherits",
            vec![Row::from_pairs([
                ("schemaname", Value::from("public")),
                ("partition_name", Value::from("events_2024_01")),
                ("bound", Value::from("FOR VALUES FROM ('2024-01-01') TO ('2024-02-01')")),
                ("size_bytes", Value::from(0)),
            ])],
        );
        let mut runner = MaintenanceRunner::new(
            db,
            MaintenanceConfig {
                tables: vec![config("events:created_at:monthly:90d"), config("logs:ts:daily")],
                ..Default::default()
            },
        );

        let report = runner.run_once_at(utc(2024, 8, 15));
        assert!(!report.has_errors());
        assert_eq!(report.tables[0].created, 3);
        assert_eq!(report.tables[0].dropped, 1);
        assert_eq!(report.tables[1].created, 3);
        assert_eq!(report.tables[1].dropped, 0);

        let db = runner.database();
        assert_eq!(db.count_matching("CREATE TABLE IF NOT EXISTS events_2024_09"), 1);
        assert_eq!(db.count_matching("CREATE TABLE IF NOT EXISTS logs_2024_08_16"), 1);
        assert_eq!(db.count_matching("DROP TABLE IF EXISTS \"public\".\"events_2024_01\""), 1);
        // No retention on logs, so its partitions are never listed.
        assert_eq!(db.count_matching("FROM pg_inherits"), 1);
    }

    #[test]
    fn failing_table_does_not_stop_others() {
        let mut db = MockDatabase::new();
        db.on_error("PARTITION OF broken", DbError::query("relation \"broken\" does not exist"));
        let mut runner = MaintenanceRunner::new(
            db,
            MaintenanceConfig {
                tables: vec![config("broken:ts:daily:7d"), config("events:ts:weekly")],
                lookahead: 2,
                ..Default::default()
            },
        );

        let report = runner.run_once_at(utc(2024, 8, 15));
        assert!(report.has_errors());
        assert_eq!(report.tables[0].errors.len(), 1);
        assert!(report.tables[0].errors[0].contains("does not exist"));
        assert_eq!(report.tables[1].created, 2);
        assert!(report.tables[1].errors.is_empty());
        assert_eq!(report.created(), 2);
    }

    #[test]
    fn started_loop_runs_immediately_and_stops() {
        let runner = MaintenanceRunner::new(
            MockDatabase::new(),
            MaintenanceConfig {
                tables: vec![PartitionConfig::new(
                    Ident::new("events").unwrap(),
                    Ident::new("ts").unwrap(),
                    Granularity::Monthly,
                )
                .with_retention(TimeDelta::days(30))],
                interval: Duration::from_secs(3600),
                lookahead: 1,
            },
        );
        let handle = runner.start().unwrap();
        let stopper = handle.stopper();
        stopper.stop();
        let runner = handle.join().unwrap();

        let db = runner.into_database();
        assert_eq!(db.count_matching("CREATE TABLE IF NOT EXISTS events_"), 1);
        assert_eq!(db.count_matching("FROM pg_inherits"), 1);
    }

    #[test]
    fn stop_returns_runner() {
        let runner = MaintenanceRunner::new(MockDatabase::new(), MaintenanceConfig::default());
        let handle = runner.start().unwrap();
        let runner = handle.stop().unwrap();
        assert!(runner.config().tables.is_empty());
    }
}
