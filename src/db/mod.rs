//! Database module: row mapping helpers and SQL repositories.
//!
//! - `model`: conversions between stored columns and domain types.
//! - `repo`: SQL-only functions grouped by table.
//!
//! Callers import from `schedule_watchbot::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

/// Key of the singleton ingestion-state row.
pub const SCHEDULE_STATE_KEY: &str = "schedule_file";
