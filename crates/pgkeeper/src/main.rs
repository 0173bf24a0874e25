//! pgkeeper - query diagnostics and partition administration.
//!
//! One-shot commands over a single connection. Every command prints a
//! human-readable summary, or the full result as JSON with `--json`.

use std::process::ExitCode;

use chrono::{NaiveDate, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use pgkeeper_core::analyzer::{AnalyzerConfig, IndexUsageStats, QueryAnalyzer, QueryStats};
use pgkeeper_core::db::PgDatabase;
use pgkeeper_core::ident::Ident;
use pgkeeper_core::partition::{
    DEFAULT_LOOKAHEAD, Granularity, MigrationOptions, PartitionConfig, PartitionInfo,
    PartitionManager,
};
use pgkeeper_core::util::{parse_date, parse_retention};

#[derive(Parser)]
#[command(
    name = "pgkeeper",
    about = "PostgreSQL query diagnostics and partition administration",
    version
)]
struct Cli {
    /// libpq connection string. Without it PGHOST, PGPORT, PGUSER,
    /// PGPASSWORD and PGDATABASE are used.
    #[arg(long, env = "PGKEEPER_DSN", global = true)]
    dsn: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is warnings only.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run EXPLAIN ANALYZE on a statement and report plan warnings.
    /// The statement is executed; wrap writes in a transaction you roll back.
    Explain { query: String },

    /// Index usage statistics.
    Indexes {
        /// Only this schema.
        #[arg(long)]
        schema: Option<String>,
        /// Only indexes never scanned (primary keys and unique indexes excluded).
        #[arg(long, conflicts_with = "duplicates")]
        unused: bool,
        /// Only indexes duplicating another index.
        #[arg(long)]
        duplicates: bool,
    },

    /// Statements with the highest mean execution time (pg_stat_statements).
    SlowQueries {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },

    /// Most frequently called statements (pg_stat_statements).
    FrequentQueries {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },

    /// Activity counters of user tables.
    Tables,

    /// Reset pg_stat_statements.
    ResetStats,

    /// List the partitions of a table.
    Partitions { table: Ident },

    /// Partition count, rows and size of a table.
    PartitionStats { table: Ident },

    /// Create future partitions, or the one partition containing --at.
    CreatePartitions {
        table: Ident,
        #[arg(short, long, default_value = "monthly")]
        granularity: Granularity,
        #[arg(short, long, default_value_t = DEFAULT_LOOKAHEAD)]
        count: u32,
        /// Create only the partition covering this date (YYYY-MM-DD, today, -7d).
        #[arg(long, value_parser = parse_date, allow_hyphen_values = true)]
        at: Option<NaiveDate>,
    },

    /// Drop partitions that ended before now minus the retention.
    DropOld {
        table: Ident,
        /// Retention such as 90d, 12w, 6mo or 1y.
        #[arg(short, long, value_parser = parse_retention)]
        retention: TimeDelta,
        /// Only list what would be dropped.
        #[arg(long)]
        dry_run: bool,
    },

    /// Create <table>_partitioned with the current and future partitions.
    Setup {
        /// table:column:granularity, e.g. transactions:created_at:monthly
        spec: PartitionConfig,
        #[arg(long, default_value_t = DEFAULT_LOOKAHEAD)]
        lookahead: u32,
    },

    /// Copy <table> into <table>_partitioned in checkpointed batches.
    Migrate {
        table: Ident,
        #[arg(long, default_value_t = 10_000)]
        batch_size: i64,
        /// Column giving the copy a stable order.
        #[arg(long, default_value = "created_at")]
        order_by: Ident,
        /// Do not persist progress.
        #[arg(long)]
        no_checkpoint: bool,
        /// Forget saved progress and start from the first row.
        #[arg(long)]
        restart: bool,
    },

    /// Rename <table> to <table>_legacy and <table>_partitioned to <table>.
    Swap { table: Ident },

    /// Detach a partition from its parent.
    Detach { table: Ident, partition: Ident },

    /// Attach a table as the partition for [from, to).
    Attach {
        table: Ident,
        partition: Ident,
        #[arg(long, value_parser = parse_date)]
        from: NaiveDate,
        #[arg(long, value_parser = parse_date)]
        to: NaiveDate,
    },
}

/// Logs go to stderr so `--json` output stays parseable.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgkeeper", "pgkeeper_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let mut db = match cli.dsn.clone() {
        Some(dsn) => PgDatabase::with_connection_string(dsn),
        None => match PgDatabase::from_env() {
            Ok(db) => db,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    match run(&cli, &mut db) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, db: &mut PgDatabase) -> pgkeeper_core::Result<()> {
    let analyzer = QueryAnalyzer::new(AnalyzerConfig::default());
    let manager = PartitionManager::new();
    let out = Output { json: cli.json };

    match &cli.command {
        Command::Explain { query } => {
            let plan = analyzer.explain_analyze(db, query, &[])?;
            out.emit(&plan, |p| {
                let m = &p.metrics;
                println!(
                    "Execution: {:.2} ms (planning {:.2} ms), cost {:.2}",
                    m.execution_time_ms, m.planning_time_ms, m.total_cost
                );
                println!(
                    "Rows: {} actual, {} estimated",
                    m.actual_rows, m.estimated_rows
                );
                println!(
                    "Nodes: {} seq scans, {} index scans, {} sorts, {} hash joins, {} nested loops",
                    m.seq_scans, m.index_scans, m.sorts, m.hash_joins, m.nested_loops
                );
                if p.warnings.is_empty() {
                    println!("No warnings");
                }
                for w in &p.warnings {
                    println!("  ! {w}");
                }
            });
        }
        Command::Indexes {
            schema,
            unused,
            duplicates,
        } => {
            let stats = if *unused {
                analyzer.get_unused_indexes(db)?
            } else if *duplicates {
                analyzer.get_duplicate_indexes(db)?
            } else if let Some(schema) = schema {
                analyzer.index_monitor().stats_for_schema(db, schema)?
            } else {
                analyzer.get_index_usage_stats(db)?
            };
            let stats: Vec<_> = match schema {
                Some(s) if *unused || *duplicates => {
                    stats.into_iter().filter(|i| &i.schema_name == s).collect()
                }
                _ => stats,
            };
            out.emit(&stats, |s| print_indexes(s));
        }
        Command::SlowQueries { limit } => {
            let stats = analyzer.get_top_slow_queries(db, *limit)?;
            out.emit(&stats, |s| print_query_stats(s));
        }
        Command::FrequentQueries { limit } => {
            let stats = analyzer.get_most_frequent_queries(db, *limit)?;
            out.emit(&stats, |s| print_query_stats(s));
        }
        Command::Tables => {
            let stats = analyzer.get_table_stats(db)?;
            out.emit(&stats, |tables| {
                println!(
                    "{:<40} {:>12} {:>12} {:>12} {:>7} {:>10}",
                    "TABLE", "SEQ SCAN", "IDX SCAN", "LIVE", "DEAD%", "SIZE"
                );
                for t in tables {
                    println!(
                        "{:<40} {:>12} {:>12} {:>12} {:>6.1}% {:>10}",
                        format!("{}.{}", t.schema_name, t.table_name),
                        t.seq_scan,
                        t.idx_scan,
                        t.n_live_tup,
                        t.dead_tuple_ratio(),
                        human_bytes(t.size_bytes)
                    );
                }
            });
        }
        Command::ResetStats => {
            analyzer.reset_query_stats(db)?;
            out.emit(&Done::new("pg_stat_statements reset"), Done::print);
        }
        Command::Partitions { table } => {
            let partitions = manager.get_partitions(db, table)?;
            out.emit(&partitions, |p| print_partitions(p));
        }
        Command::PartitionStats { table } => {
            let stats = manager.get_partition_stats(db, table)?;
            out.emit(&stats, |s| {
                println!("Table: {}", s.table);
                println!("Partitions: {}", s.partition_count);
                println!("Rows: {}", s.total_rows);
                println!("Size: {}", human_bytes(s.total_size_bytes));
                println!(
                    "Range: {} .. {}",
                    fmt_bound(s.oldest_start),
                    fmt_bound(s.newest_end)
                );
            });
        }
        Command::CreatePartitions {
            table,
            granularity,
            count,
            at,
        } => {
            if let Some(at) = at {
                let p = manager.create_partition(db, table, *granularity, *at)?;
                out.emit(&p, |p| {
                    println!(
                        "Created {} [{} .. {})",
                        p.name,
                        fmt_bound(p.range_start),
                        fmt_bound(p.range_end)
                    )
                });
            } else {
                let created = manager.create_future_partitions(db, table, *granularity, *count)?;
                out.emit(
                    &Done::new(format!("{created} of {count} future partitions ensured")),
                    Done::print,
                );
            }
        }
        Command::DropOld {
            table,
            retention,
            dry_run,
        } => {
            if *dry_run {
                let cutoff = Utc::now() - *retention;
                let expired: Vec<PartitionInfo> = manager
                    .get_partitions(db, table)?
                    .into_iter()
                    .filter(|p| p.range_end.is_some_and(|end| end < cutoff))
                    .collect();
                out.emit(&expired, |p| print_partitions(p));
            } else {
                let dropped = manager.drop_old_partitions(db, table, *retention)?;
                out.emit(&Done::new(format!("{dropped} partitions dropped")), Done::print);
            }
        }
        Command::Setup { spec, lookahead } => {
            let setup = manager
                .clone()
                .with_lookahead(*lookahead)
                .setup_partitioning(db, spec, Utc::now())?;
            out.emit(&setup, |s| {
                if s.created_table {
                    println!("Created {} partitioned like {}", s.target, s.source);
                } else {
                    println!("{} already partitioned", s.target);
                }
                print_partitions(&s.partitions);
            });
        }
        Command::Migrate {
            table,
            batch_size,
            order_by,
            no_checkpoint,
            restart,
        } => {
            let target = table.with_suffix("partitioned")?;
            if *restart {
                manager.clear_migration_checkpoint(db, table, &target)?;
            }
            let options = MigrationOptions {
                batch_size: *batch_size,
                order_by: order_by.clone(),
                checkpoint: !*no_checkpoint,
            };
            let report = manager.migrate_to_partitioned(db, table, &target, &options)?;
            out.emit(&report, |r| {
                println!(
                    "Migrated {} rows from {} to {} in {} batches ({} rows in source, resumed at {})",
                    r.migrated_rows, r.source, r.target, r.batches, r.total_rows, r.resumed_from
                )
            });
        }
        Command::Swap { table } => {
            let legacy = manager.swap_in_partitioned(db, table)?;
            out.emit(
                &Done::new(format!("{table} is now partitioned; old table kept as {legacy}")),
                Done::print,
            );
        }
        Command::Detach { table, partition } => {
            manager.detach_partition(db, table, partition)?;
            out.emit(&Done::new(format!("{partition} detached from {table}")), Done::print);
        }
        Command::Attach {
            table,
            partition,
            from,
            to,
        } => {
            manager.attach_partition(db, table, partition, *from, *to)?;
            out.emit(
                &Done::new(format!("{partition} attached to {table} for [{from}, {to})")),
                Done::print,
            );
        }
    }
    Ok(())
}

struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) {
        if self.json {
            match serde_json::to_string_pretty(value) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("Error encoding JSON: {e}"),
            }
        } else {
            human(value);
        }
    }
}

/// Result of commands that only change state.
#[derive(Serialize)]
struct Done {
    ok: bool,
    message: String,
}

impl Done {
    fn new(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn print(&self) {
        println!("{}", self.message);
    }
}

fn print_indexes(stats: &[IndexUsageStats]) {
    if stats.is_empty() {
        println!("No indexes");
        return;
    }
    println!(
        "{:<50} {:>12} {:>10} {:>8}",
        "INDEX", "SCANS", "SIZE", "SCAN/MB"
    );
    for s in stats {
        println!(
            "{:<50} {:>12} {:>10} {:>8.2}",
            format!("{}.{}", s.schema_name, s.index_name),
            s.idx_scan,
            human_bytes(s.size_bytes),
            s.usage_ratio
        );
        if !s.recommendation.is_empty() {
            println!("    {}", s.recommendation);
        }
    }
}

fn print_query_stats(stats: &[QueryStats]) {
    for (i, s) in stats.iter().enumerate() {
        println!(
            "#{:<3} calls={} mean={:.2}ms total={:.2}ms rows={} cache={:.1}%",
            i + 1,
            s.calls,
            s.mean_exec_time_ms,
            s.total_exec_time_ms,
            s.rows,
            s.cache_hit_ratio
        );
        println!("     {}", truncate(&s.query, 120));
    }
}

fn print_partitions(partitions: &[PartitionInfo]) {
    if partitions.is_empty() {
        println!("No partitions");
        return;
    }
    println!(
        "{:<50} {:<22} {:<22} {:>12} {:>10}",
        "PARTITION", "FROM", "TO", "ROWS", "SIZE"
    );
    for p in partitions {
        println!(
            "{:<50} {:<22} {:<22} {:>12} {:>10}",
            format!("{}.{}", p.schema, p.name),
            fmt_bound(p.range_start),
            fmt_bound(p.range_end),
            p.row_count,
            human_bytes(p.size_bytes)
        );
    }
}

fn fmt_bound(ts: Option<chrono::DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn human_bytes(bytes: i64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.1} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

/// Collapses whitespace and cuts to `max` characters.
fn truncate(query: &str, max: usize) -> String {
    let flat = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
