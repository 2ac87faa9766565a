//! SQLite schema for raw events and aggregates.
//!
//! # Layout
//!
//! ```text
//! counters             gauges                <- raw, pending rollup
//!   id, name, value, starts_at
//!
//! aggregated_counters  aggregated_gauges     <- one row per (name, starts_at, duration)
//!   id, name, starts_at, duration, period, sum, count, value
//!
//! aggregates                                 <- view: union of both aggregate tables
//! ```
//!
//! Timestamps are stored as integer seconds since the epoch (UTC).
//! `starts_at` in an aggregate table is the bucket start.

use rusqlite::Connection;

use crate::event::EventKind;

/// Columns of the `aggregates` view, in order.
pub const AGGREGATE_COLUMNS: [&str; 7] = [
    "name",
    "starts_at",
    "period",
    "duration",
    "sum",
    "count",
    "value",
];

fn kind_ddl(kind: EventKind) -> String {
    let raw = kind.raw_table();
    let agg = kind.aggregate_table();

    format!(
        "CREATE TABLE IF NOT EXISTS {raw}(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            starts_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        CREATE INDEX IF NOT EXISTS {raw}_idx1 ON {raw}(name, starts_at);

        CREATE TABLE IF NOT EXISTS {agg}(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            starts_at INTEGER NOT NULL,
            duration INTEGER NOT NULL,
            period TEXT NOT NULL,
            sum REAL NOT NULL,
            count INTEGER NOT NULL,
            value REAL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS {agg}_uidx1 ON {agg}(name, starts_at, duration);
        CREATE INDEX IF NOT EXISTS {agg}_idx2 ON {agg}(starts_at);
        CREATE INDEX IF NOT EXISTS {agg}_idx3 ON {agg}(duration);"
    )
}

fn view_ddl() -> String {
    let cols = AGGREGATE_COLUMNS.join(", ");
    format!(
        "CREATE VIEW IF NOT EXISTS aggregates AS
            SELECT {cols} FROM {gauges}
            UNION ALL
            SELECT {cols} FROM {counters};",
        gauges = EventKind::Gauge.aggregate_table(),
        counters = EventKind::Counter.aggregate_table(),
    )
}

/// Applies connection pragmas suited to a single-writer workload.
///
/// # Errors
///
/// Returns the SQLite error if a pragma cannot be set.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode returns a row, so it goes through pragma_update_and_check
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(journal_mode = %mode, "journal mode set");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Creates all tables, indexes and the `aggregates` view if missing.
///
/// # Errors
///
/// Returns the SQLite error if any statement fails.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let mut ddl = String::new();
    for kind in EventKind::ALL {
        ddl.push_str(&kind_ddl(kind));
    }
    ddl.push_str(&view_ddl());
    conn.execute_batch(&ddl)
}
