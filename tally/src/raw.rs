//! Raw event tables: the holding area between ingestion and rollup.
//!
//! Rows are only ever inserted (one per expanded name) and bulk-deleted once a
//! rollup pass has folded them into every requested period.

use std::collections::HashMap;

use chrono::DateTime;
use rusqlite::{Connection, params};

use crate::error::RecordError;
use crate::event::{Event, EventKind};
use crate::name;
use crate::period::Period;

/// A pending raw row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// Expanded metric name.
    pub name: String,
    /// Reported value.
    pub value: f64,
    /// Seconds since the epoch.
    pub at: i64,
}

/// Running sum and count for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tally {
    /// Sum of values.
    pub sum: f64,
    /// Number of values.
    pub count: i64,
}

impl Tally {
    /// Adds a single value.
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Folds another tally into this one.
    pub fn merge(&mut self, other: Tally) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Raw rows of one kind summarized by `(name, bucket_start)` for one period.
#[derive(Debug, Default)]
pub struct Summary {
    /// Accumulated tallies keyed by name and bucket start.
    pub buckets: HashMap<(String, i64), Tally>,
    /// Earliest bucket start among the summarized rows.
    pub earliest_bucket: Option<i64>,
}

/// Checks an event before it is written.
///
/// # Errors
///
/// Returns a [`RecordError`] for an invalid name, a non-finite value, or a
/// timestamp chrono cannot place on the calendar.
pub fn validate(name: &str, value: f64, at: i64) -> Result<(), RecordError> {
    name::validate(name)?;
    if !value.is_finite() {
        return Err(RecordError::InvalidValue {
            name: name.to_string(),
            value,
        });
    }
    if DateTime::from_timestamp(at, 0).is_none() {
        return Err(RecordError::InvalidTimestamp { at });
    }
    Ok(())
}

/// Inserts one raw row per expanded name.
///
/// The event must already have been validated and its timestamp resolved.
/// Returns the number of rows written.
///
/// # Errors
///
/// Returns the SQLite error if an insert fails.
pub fn insert(conn: &Connection, event: &Event, at: i64) -> rusqlite::Result<usize> {
    let sql = format!(
        "INSERT INTO {}(name, value, starts_at) VALUES (?1, ?2, ?3)",
        event.kind.raw_table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let names = name::expand(&event.name);
    for name in &names {
        stmt.execute(params![name, event.value, at])?;
    }
    Ok(names.len())
}

/// Reads every pending raw row of a kind.
///
/// # Errors
///
/// Returns the SQLite error if the query fails.
pub fn load(conn: &Connection, kind: EventKind) -> rusqlite::Result<Vec<RawRow>> {
    let sql = format!("SELECT name, value, starts_at FROM {}", kind.raw_table());
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(RawRow {
            name: row.get(0)?,
            value: row.get(1)?,
            at: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Groups raw rows into the buckets of a period.
pub fn summarize(rows: &[RawRow], period: Period) -> Summary {
    let mut summary = Summary::default();
    for row in rows {
        let bucket = period.bucket_start(row.at);
        summary
            .buckets
            .entry((row.name.clone(), bucket))
            .or_default()
            .add(row.value);
        summary.earliest_bucket = Some(summary.earliest_bucket.map_or(bucket, |b| b.min(bucket)));
    }
    summary
}

/// Counts pending raw rows of a kind.
///
/// # Errors
///
/// Returns the SQLite error if the query fails.
pub fn pending(conn: &Connection, kind: EventKind) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", kind.raw_table());
    let count: i64 = conn.prepare_cached(&sql)?.query_row([], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Deletes every raw row of a kind, returning how many were removed.
///
/// # Errors
///
/// Returns the SQLite error if the delete fails.
pub fn clear(conn: &Connection, kind: EventKind) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {}", kind.raw_table());
    conn.prepare_cached(&sql)?.execute([])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_fans_out() {
        let conn = conn();
        let event = Event::counter("foo.bar.baz", 2.0, None);

        assert_eq!(insert(&conn, &event, 100).unwrap(), 3);

        let mut rows = load(&conn, EventKind::Counter).unwrap();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "foo.bar", "foo.bar.baz"]);
        assert!(rows.iter().all(|r| r.value == 2.0 && r.at == 100));

        assert_eq!(pending(&conn, EventKind::Gauge).unwrap(), 0);
    }

    #[test]
    fn test_summarize_groups_by_bucket() {
        let rows = vec![
            RawRow { name: "a".into(), value: 1.0, at: 61 },
            RawRow { name: "a".into(), value: 2.0, at: 119 },
            RawRow { name: "a".into(), value: 4.0, at: 120 },
            RawRow { name: "b".into(), value: 8.0, at: 62 },
        ];

        let summary = summarize(&rows, Period::Minute);
        assert_eq!(summary.buckets.len(), 3);
        assert_eq!(
            summary.buckets[&("a".to_string(), 60)],
            Tally { sum: 3.0, count: 2 }
        );
        assert_eq!(
            summary.buckets[&("a".to_string(), 120)],
            Tally { sum: 4.0, count: 1 }
        );
        assert_eq!(summary.earliest_bucket, Some(60));

        assert!(summarize(&[], Period::Minute).earliest_bucket.is_none());
    }

    #[test]
    fn test_clear() {
        let conn = conn();
        insert(&conn, &Event::gauge("x.y", 1.0, None), 5).unwrap();
        assert_eq!(pending(&conn, EventKind::Gauge).unwrap(), 2);
        assert_eq!(clear(&conn, EventKind::Gauge).unwrap(), 2);
        assert_eq!(pending(&conn, EventKind::Gauge).unwrap(), 0);
    }

    #[test]
    fn test_validate() {
        assert!(validate("ok", 1.0, 0).is_ok());
        assert!(matches!(
            validate("ok", f64::NAN, 0),
            Err(RecordError::InvalidValue { .. })
        ));
        assert!(matches!(
            validate("ok", 1.0, i64::MAX),
            Err(RecordError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            validate("", 1.0, 0),
            Err(RecordError::InvalidName { .. })
        ));
    }
}
