//! pgkeeper-core - PostgreSQL query diagnostics and partition maintenance.
//!
//! Provides:
//! - `analyzer` - EXPLAIN ANALYZE plans and warnings, slow-query log, index
//!   usage monitor, pg_stat_statements and table statistics
//! - `query` - offset and keyset pagination, batched writes, grouped and
//!   time-bucketed aggregation, transaction retry
//! - `partition` - range partition creation, retention, migration and the
//!   background maintenance runner
//! - `db` - connection traits, owned rows, the PostgreSQL backend and a
//!   scripted mock for tests
//! - `ident` - identifier validation and SQL keyword enums
//! - `cache` - TTL cache used by catalog monitors
//! - `util` - duration and date parsing for command-line tools

pub mod analyzer;
pub mod cache;
pub mod db;
pub mod error;
pub mod ident;
pub mod partition;
pub mod query;
pub mod util;

pub use error::{DbError, Error, Result};
