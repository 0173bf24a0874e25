//! pgkeeperd - partition maintenance daemon.
//!
//! Keeps range-partitioned tables supplied with future partitions and drops
//! partitions that fell out of their retention window, once per interval.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgkeeper_core::db::PgDatabase;
use pgkeeper_core::partition::{
    DEFAULT_LOOKAHEAD, MaintenanceConfig, MaintenanceReport, MaintenanceRunner, PartitionConfig,
};
use pgkeeper_core::util::parse_interval;

/// Partition maintenance daemon.
#[derive(Parser)]
#[command(name = "pgkeeperd", about = "Partition maintenance daemon", version)]
struct Args {
    /// Time between maintenance cycles (e.g. "30m", "1h", "3600").
    #[arg(short, long, default_value = "1h", value_parser = parse_interval)]
    interval: Duration,

    /// Managed table as table:column:granularity[:retention], e.g.
    /// "events:created_at:monthly:90d". Repeat for several tables.
    #[arg(short, long = "table", value_name = "SPEC", required = true, value_parser = parse_table)]
    tables: Vec<PartitionConfig>,

    /// Future partitions to keep ahead of the current one.
    #[arg(long, default_value_t = DEFAULT_LOOKAHEAD)]
    lookahead: u32,

    /// libpq connection string. Without it PGHOST, PGPORT, PGUSER,
    /// PGPASSWORD and PGDATABASE are used.
    #[arg(long, env = "PGKEEPER_DSN")]
    dsn: Option<String>,

    /// Run a single cycle and exit; the exit code reports failures.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_table(s: &str) -> Result<PartitionConfig, String> {
    s.parse().map_err(|e: pgkeeper_core::Error| e.to_string())
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgkeeperd", "pgkeeper_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One line per table, for the cycle log.
fn describe_report(report: &MaintenanceReport) -> String {
    report
        .tables
        .iter()
        .map(|t| {
            let mut line = format!("{}: +{} -{}", t.table, t.created, t.dropped);
            if !t.errors.is_empty() {
                line.push_str(&format!(" ({} errors)", t.errors.len()));
            }
            line
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_table(t: &PartitionConfig) -> String {
    if t.has_retention() {
        format!(
            "{} by {} ({}, keep {} days)",
            t.table,
            t.column,
            t.granularity,
            t.retention.num_days()
        )
    } else {
        format!("{} by {} ({}, keep all)", t.table, t.column, t.granularity)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("pgkeeperd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, lookahead={}, tables={}",
        args.interval.as_secs(),
        args.lookahead,
        args.tables.len()
    );
    for t in &args.tables {
        info!("Managing {}", describe_table(t));
    }

    let mut db = match args.dsn {
        Some(dsn) => PgDatabase::with_connection_string(dsn),
        None => match PgDatabase::from_env() {
            Ok(db) => db,
            Err(e) => {
                error!("PostgreSQL: {}", e);
                print_pg_hint();
                return ExitCode::FAILURE;
            }
        },
    };
    // The connection is reopened on every cycle that needs it, so a server
    // that is down at startup is not fatal.
    if let Err(e) = db.try_connect() {
        warn!("PostgreSQL: connection failed ({}), retrying each cycle", e);
    }

    let mut runner = MaintenanceRunner::new(
        db,
        MaintenanceConfig {
            tables: args.tables,
            interval: args.interval,
            lookahead: args.lookahead,
        },
    );

    if args.once {
        let report = runner.run_once();
        info!("Cycle: {}", describe_report(&report));
        for t in &report.tables {
            for e in &t.errors {
                error!("{}: {}", t.table, e);
            }
        }
        return if report.has_errors() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };
    }

    let handle = match runner.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let stopper = handle.stopper();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        stopper.stop();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    // Blocks until the handler stops the loop; a cycle in progress finishes first.
    let stopped = handle.join();
    info!("Shutting down...");
    if stopped.is_none() {
        error!("Maintenance loop panicked");
        return ExitCode::FAILURE;
    }
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Prints connection hints when no connection settings were found.
fn print_pg_hint() {
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{YELLOW}  Pass --dsn or configure the connection with environment variables:");
    eprintln!("    export PGHOST=localhost");
    eprintln!("    export PGPORT=5432");
    eprintln!("    export PGUSER=postgres");
    eprintln!("    export PGPASSWORD=secret");
    eprintln!("    export PGDATABASE=postgres{RESET}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pgkeeper_core::partition::TableMaintenance;

    #[test]
    fn describe_report_lists_tables_and_errors() {
        let report = MaintenanceReport {
            started_at: Utc::now(),
            tables: vec![
                TableMaintenance {
                    table: "events".to_string(),
                    created: 3,
                    dropped: 1,
                    errors: Vec::new(),
                },
                TableMaintenance {
                    table: "logs".to_string(),
                    created: 0,
                    dropped: 0,
                    errors: vec!["relation \"logs\" does not exist".to_string()],
                },
            ],
        };
        assert_eq!(describe_report(&report), "events: +3 -1, logs: +0 -0 (1 errors)");
    }

    #[test]
    fn args_accept_repeated_tables() {
        let args = Args::try_parse_from([
            "pgkeeperd",
            "--table",
            "events:created_at:monthly:90d",
            "-t",
            "logs:ts:daily",
            "--interval",
            "30m",
        ])
        .unwrap();
        assert_eq!(args.tables.len(), 2);
        assert_eq!(args.interval, Duration::from_secs(1800));
        assert_eq!(args.lookahead, DEFAULT_LOOKAHEAD);
        assert_eq!(describe_table(&args.tables[0]), "events by created_at (monthly, keep 90 days)");
        assert_eq!(describe_table(&args.tables[1]), "logs by ts (daily, keep all)");
    }

    #[test]
    fn args_reject_bad_table_spec() {
        assert!(Args::try_parse_from(["pgkeeperd", "--table", "Events:ts:monthly"]).is_err());
        assert!(Args::try_parse_from(["pgkeeperd"]).is_err());
    }
}
