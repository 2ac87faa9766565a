//! Rollup engine: folds raw events into per-period aggregates.
//!
//! # Design
//!
//! Each pass runs once per [`EventKind`], inside that kind's own transaction:
//! - Load every pending raw row of the kind
//! - For each requested period, group the rows by `(name, bucket_start)`
//! - Fetch the existing aggregates of that period from the earliest touched
//!   bucket onwards
//! - Add raw and existing `sum`/`count` per key and upsert the result
//! - Delete all raw rows of the kind
//!
//! # Rollup Flow
//!
//! ```text
//! counters ──┐                    ┌─► minute ─┐
//!            ├─► summarize per ───┼─► hour   ─┼─► upsert ─► aggregated_counters
//! existing ──┘   period           └─► ...    ─┘
//! ```
//!
//! Keeping `sum` and `count` (not just `value`) makes repeated passes exact:
//! two passes over disjoint batches produce the same rows as one pass over
//! their union, and a pass with nothing pending leaves every row untouched.
//!
//! Raw rows are deleted for the kind as a whole. A pass that requests only
//! some periods therefore never feeds the skipped ones with that batch.

use std::collections::HashMap;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::error::RollupError;
use crate::event::EventKind;
use crate::period::Period;
use crate::raw::{self, Tally};

/// One stored aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Metric name (any level of the dotted hierarchy).
    pub name: String,
    /// Bucket start, seconds since the epoch.
    pub starts_at: i64,
    /// The period this bucket belongs to.
    pub period: Period,
    /// Nominal period length in seconds.
    pub duration: i64,
    /// Sum of all values in the bucket.
    pub sum: f64,
    /// Number of values in the bucket.
    pub count: i64,
    /// `sum` for counters, `sum / count` for gauges.
    pub value: f64,
}

/// Work done by a pass for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    /// Raw rows consumed (and deleted).
    pub raw_rows: usize,
    /// Aggregate rows inserted or updated, across all periods.
    pub rows_written: usize,
    /// Buckets left untouched because their sum overflowed `f64`.
    pub overflowed: usize,
}

/// Work done by a full rollup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    /// Counter pass.
    pub counters: KindReport,
    /// Gauge pass.
    pub gauges: KindReport,
}

impl RollupReport {
    /// Mutable access to the report of one kind.
    pub fn kind_mut(&mut self, kind: EventKind) -> &mut KindReport {
        match kind {
            EventKind::Counter => &mut self.counters,
            EventKind::Gauge => &mut self.gauges,
        }
    }

    /// Total raw rows consumed by the pass.
    pub fn raw_rows(&self) -> usize {
        self.counters.raw_rows + self.gauges.raw_rows
    }
}

/// Rolls up all pending rows of one kind in a single transaction.
///
/// Duplicate entries in `periods` are ignored. On error nothing is written
/// and the raw rows stay in place.
///
/// # Errors
///
/// Returns a [`RollupError`] naming the kind if any statement fails.
pub fn rollup_kind(
    conn: &mut Connection,
    kind: EventKind,
    periods: &[Period],
) -> Result<KindReport, RollupError> {
    let fail = |source| RollupError { kind, source };

    let tx = conn.transaction().map_err(fail)?;
    let report = rollup_in(&tx, kind, periods).map_err(fail)?;
    tx.commit().map_err(fail)?;

    tracing::debug!(
        %kind,
        raw_rows = report.raw_rows,
        rows_written = report.rows_written,
        overflowed = report.overflowed,
        "rollup pass committed"
    );
    Ok(report)
}

fn rollup_in(conn: &Connection, kind: EventKind, periods: &[Period]) -> rusqlite::Result<KindReport> {
    let rows = raw::load(conn, kind)?;
    if rows.is_empty() {
        return Ok(KindReport::default());
    }

    // A period listed twice would fold the same raw rows in twice
    let mut periods = periods.to_vec();
    periods.sort_unstable();
    periods.dedup();

    let mut rows_written = 0;
    let mut overflowed = 0;
    for period in periods {
        let summary = raw::summarize(&rows, period);
        let Some(earliest) = summary.earliest_bucket else {
            continue;
        };

        let mut existing = load_existing(conn, kind, period, earliest)?;
        for (key, raw_tally) in summary.buckets {
            let mut merged = existing.remove(&key).unwrap_or_default();
            merged.merge(raw_tally);
            // SQLite stores NaN as NULL, which the NOT NULL sum rejects
            if !merged.sum.is_finite() {
                tracing::warn!(
                    %kind,
                    name = %key.0,
                    %period,
                    starts_at = key.1,
                    "aggregate sum out of range, bucket left unchanged"
                );
                overflowed += 1;
                continue;
            }
            upsert(conn, kind, period, &key.0, key.1, merged)?;
            rows_written += 1;
        }
    }

    let raw_rows = raw::clear(conn, kind)?;
    Ok(KindReport {
        raw_rows,
        rows_written,
        overflowed,
    })
}

/// Existing tallies of one period whose bucket starts at or after `from`.
///
/// `from` is the earliest bucket touched by the pending rows: buckets before
/// it cannot receive anything from this pass.
fn load_existing(
    conn: &Connection,
    kind: EventKind,
    period: Period,
    from: i64,
) -> rusqlite::Result<HashMap<(String, i64), Tally>> {
    let sql = format!(
        "SELECT name, starts_at, sum, count FROM {}
         WHERE duration = ?1 AND starts_at >= ?2",
        kind.aggregate_table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![period.duration(), from], |row| {
        Ok((
            (row.get::<_, String>(0)?, row.get::<_, i64>(1)?),
            Tally {
                sum: row.get(2)?,
                count: row.get(3)?,
            },
        ))
    })?;
    rows.collect()
}

fn upsert(
    conn: &Connection,
    kind: EventKind,
    period: Period,
    name: &str,
    starts_at: i64,
    tally: Tally,
) -> rusqlite::Result<()> {
    let sql = format!(
        "INSERT INTO {}(name, starts_at, duration, period, sum, count, value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(name, starts_at, duration) DO UPDATE SET
            period = excluded.period,
            sum = excluded.sum,
            count = excluded.count,
            value = excluded.value",
        kind.aggregate_table()
    );
    conn.prepare_cached(&sql)?.execute(params![
        name,
        starts_at,
        period.duration(),
        period.name(),
        tally.sum,
        tally.count,
        kind.value(tally.sum, tally.count),
    ])?;
    Ok(())
}

/// Reads stored aggregates of one kind, ordered by duration, name and bucket.
///
/// `period` and `name` narrow the result when given.
///
/// # Errors
///
/// Returns the SQLite error if the query fails or a row holds an unknown
/// duration.
pub fn load_rows(
    conn: &Connection,
    kind: EventKind,
    period: Option<Period>,
    name: Option<&str>,
) -> rusqlite::Result<Vec<AggregateRow>> {
    let sql = format!(
        "SELECT name, starts_at, duration, sum, count, value FROM {}
         WHERE (?1 IS NULL OR duration = ?1) AND (?2 IS NULL OR name = ?2)
         ORDER BY duration, name, starts_at",
        kind.aggregate_table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![period.map(Period::duration), name], |row| {
        let duration: i64 = row.get(2)?;
        let period = Period::from_duration(duration)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, duration))?;
        Ok(AggregateRow {
            name: row.get(0)?,
            starts_at: row.get(1)?,
            period,
            duration,
            sum: row.get(3)?,
            count: row.get(4)?,
            value: row.get::<_, Option<f64>>(5)?.unwrap_or(f64::NAN),
        })
    })?;
    rows.collect()
}
