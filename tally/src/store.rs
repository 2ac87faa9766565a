//! The store handle: one SQLite connection plus the record and rollup API.
//!
//! # Design
//!
//! The Store is the single owner of the connection:
//! - Creates the schema and sets pragmas on open (skipped when read-only)
//! - Expands and records counter and gauge events into the raw tables
//! - Runs rollup passes, one transaction per event kind
//! - Answers typed queries, caching the column descriptor per SQL text
//!
//! ```text
//! record(kind, name, value, at)
//!     │ validate ── invalid ──► warn, Ok(0)
//!     ▼
//! expand name ──► raw table (one row per ancestor)
//!
//! aggregate(periods)
//!     │ for each kind, own transaction
//!     ▼
//! raw rows + existing aggregates ──► upsert aggregates ──► clear raw
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use tally::{EventKind, Period, Store};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::open_in_memory()?;
//!
//! // Two raw rows: "web.hits" and "web"
//! store.count("web.hits", 1.0, Some(1_393_762_211))?;
//! store.gauge("web.load", 0.5, Some(1_393_762_211))?;
//! assert_eq!(store.pending(EventKind::Counter)?, 2);
//!
//! let report = store.aggregate(&[Period::Day])?;
//! assert_eq!(report.counters.raw_rows, 2);
//!
//! let web = store.aggregates(EventKind::Counter, Some(Period::Day), Some("web"))?;
//! assert_eq!(web[0].value, 1.0);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OpenFlags, Transaction};
use serde::Serialize;

use crate::error::{Result, StoreError, TallyError};
use crate::event::{Event, EventKind};
use crate::period::Period;
use crate::query::{Column, QueryResult, Row, Value};
use crate::raw;
use crate::rollup::{self, AggregateRow, RollupReport};
use crate::schema;

/// Outcome of [`Store::record_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Events written to the raw tables.
    pub recorded: usize,
    /// Malformed events that were logged and skipped.
    pub dropped: usize,
    /// Raw rows inserted, after name expansion.
    pub rows: usize,
}

/// Pending and aggregated row counts, as shown by `tally info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreInfo {
    /// Raw counter rows awaiting rollup.
    pub pending_counters: u64,
    /// Raw gauge rows awaiting rollup.
    pub pending_gauges: u64,
    /// Aggregate rows of both kinds, per period, finest first.
    pub aggregates: Vec<(Period, u64)>,
}

/// Top-level handle on a tally database.
///
/// # Thread Safety
///
/// A Store wraps a single `rusqlite::Connection` and is not `Sync`. The
/// ingestion server shares it as `Arc<Mutex<Store>>` and only locks it from
/// blocking tasks.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
    readonly: bool,
    /// Column descriptors keyed by SQL text.
    shapes: HashMap<String, Arc<[Column]>>,
}

impl Store {
    /// Opens (creating if needed) a database file and ensures the schema.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Open`] if the file cannot be opened
    /// - [`StoreError::Sqlite`] if pragmas or schema creation fail
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        schema::apply_pragmas(&conn).map_err(StoreError::from)?;
        schema::init_schema(&conn).map_err(StoreError::from)?;

        tracing::info!(path = %path.display(), "store opened");
        Ok(Self::from_parts(conn, Some(path), false))
    }

    /// Opens a private in-memory database with the schema in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if schema creation fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        schema::init_schema(&conn).map_err(StoreError::from)?;
        Ok(Self::from_parts(conn, None, false))
    }

    /// Opens an existing database for inspection only.
    ///
    /// The schema is not created and `PRAGMA query_only` is set, so any write
    /// fails with a storage error.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Open`] if the file does not exist or cannot be opened
    /// - [`StoreError::Sqlite`] if the pragma cannot be set
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        conn.pragma_update(None, "query_only", true)
            .map_err(StoreError::from)?;

        tracing::debug!(path = %path.display(), "store opened read-only");
        Ok(Self::from_parts(conn, Some(path), true))
    }

    fn from_parts(conn: Connection, path: Option<PathBuf>, readonly: bool) -> Self {
        Self {
            conn,
            path,
            readonly,
            shapes: HashMap::new(),
        }
    }

    /// The database path, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if the store was opened with [`Store::open_readonly`].
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StoreError::ReadOnly.into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw SQL surface
    // ------------------------------------------------------------------

    /// Executes one or more `;`-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if any statement fails.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Executes one parameterized statement through the statement cache.
    ///
    /// Returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if preparation or execution fails.
    pub fn run(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        let changed = self.conn.prepare_cached(sql)?.execute(params)?;
        Ok(changed)
    }

    /// Runs a query and decodes every row through its column descriptor.
    ///
    /// Column types come from the column names ([`ColumnType::for_name`]);
    /// the descriptor is computed once per distinct SQL text.
    ///
    /// [`ColumnType::for_name`]: crate::query::ColumnType::for_name
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub fn select(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<QueryResult> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns = match self.shapes.get(sql) {
            Some(columns) => Arc::clone(columns),
            None => {
                let columns: Arc<[Column]> = stmt
                    .column_names()
                    .into_iter()
                    .map(Column::inferred)
                    .collect();
                self.shapes.insert(sql.to_string(), Arc::clone(&columns));
                columns
            }
        };
        let rows = decode_rows(&mut stmt, params, &columns)?;
        Ok(QueryResult::new(columns, rows))
    }

    /// Runs a query with explicit column types.
    ///
    /// Columns named in `declared` use the given type; the rest are typed by
    /// name as in [`Store::select`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub fn select_as(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        declared: &[Column],
    ) -> Result<QueryResult> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Arc<[Column]> = stmt
            .column_names()
            .into_iter()
            .map(|name| {
                declared
                    .iter()
                    .find(|c| c.name == name)
                    .cloned()
                    .unwrap_or_else(|| Column::inferred(name))
            })
            .collect();
        let rows = decode_rows(&mut stmt, params, &columns)?;
        Ok(QueryResult::new(columns, rows))
    }

    /// Returns the first column of the first row, or `None` if no row matched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub fn ask(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Value>> {
        let result = self.select(sql, params)?;
        Ok(result
            .rows()
            .first()
            .and_then(|row| row.values().first().cloned()))
    }

    /// Runs `f` inside a transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or [`StoreError::Sqlite`] if the
    /// transaction cannot be started or committed.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Records one event, fanning it out to every ancestor name.
    ///
    /// `at` defaults to now. A malformed event (bad name, non-finite value,
    /// out-of-range timestamp) is logged at `warn` and dropped: the call
    /// returns `Ok(0)`.
    ///
    /// Returns the number of raw rows written.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ReadOnly`] on a read-only store
    /// - [`StoreError::Sqlite`] if an insert fails
    pub fn record(&mut self, kind: EventKind, name: &str, value: f64, at: Option<i64>) -> Result<usize> {
        self.ensure_writable()?;
        let event = Event {
            kind,
            name: name.to_string(),
            value,
            at,
        };
        Ok(record_on(&self.conn, &event)?.unwrap_or(0))
    }

    /// Records many events in one transaction.
    ///
    /// Malformed events are skipped and counted in
    /// [`BatchSummary::dropped`]; they never abort the batch.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ReadOnly`] on a read-only store
    /// - [`StoreError::Sqlite`] if an insert fails, in which case nothing
    ///   from the batch is kept
    pub fn record_batch(&mut self, events: &[Event]) -> Result<BatchSummary> {
        self.ensure_writable()?;
        self.transaction(|tx| {
            let mut summary = BatchSummary::default();
            for event in events {
                match record_on(tx, event)? {
                    Some(rows) => {
                        summary.recorded += 1;
                        summary.rows += rows;
                    }
                    None => summary.dropped += 1,
                }
            }
            Ok(summary)
        })
    }

    /// Records a counter event. See [`Store::record`].
    ///
    /// # Errors
    ///
    /// As for [`Store::record`].
    pub fn count(&mut self, name: &str, value: f64, at: Option<i64>) -> Result<usize> {
        self.record(EventKind::Counter, name, value, at)
    }

    /// Records a gauge event. See [`Store::record`].
    ///
    /// # Errors
    ///
    /// As for [`Store::record`].
    pub fn gauge(&mut self, name: &str, value: f64, at: Option<i64>) -> Result<usize> {
        self.record(EventKind::Gauge, name, value, at)
    }

    /// Runs `f` and records its wall-clock duration in seconds as a gauge.
    ///
    /// # Errors
    ///
    /// As for [`Store::record`]; `f` has already run when an error is
    /// returned.
    pub fn measure<T, F>(&mut self, name: &str, at: Option<i64>, f: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let out = f();
        self.gauge(name, start.elapsed().as_secs_f64(), at)?;
        Ok(out)
    }

    /// Number of raw rows of `kind` awaiting rollup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the count fails.
    pub fn pending(&self, kind: EventKind) -> Result<u64> {
        Ok(raw::pending(&self.conn, kind)?)
    }

    // ------------------------------------------------------------------
    // Rollup
    // ------------------------------------------------------------------

    /// Folds every pending raw row into the aggregates of `periods`.
    ///
    /// An empty slice means [`Period::DEFAULT`]. Each kind runs in its own
    /// transaction: if one kind fails the other is still rolled up, and the
    /// first failure is returned.
    ///
    /// Raw rows are cleared for the whole kind, so periods left out of this
    /// call never see the rows consumed by it.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ReadOnly`] on a read-only store
    /// - [`TallyError::Rollup`] naming the kind that was rolled back
    pub fn aggregate(&mut self, periods: &[Period]) -> Result<RollupReport> {
        self.ensure_writable()?;
        let periods = if periods.is_empty() {
            &Period::DEFAULT[..]
        } else {
            periods
        };

        let mut report = RollupReport::default();
        let mut first_error = None;
        for kind in EventKind::ALL {
            match rollup::rollup_kind(&mut self.conn, kind, periods) {
                Ok(kind_report) => *report.kind_mut(kind) = kind_report,
                Err(err) => {
                    tracing::error!(%kind, error = %err, "rollup pass rolled back");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(TallyError::Rollup(err)),
            None => Ok(report),
        }
    }

    /// Reads stored aggregates of one kind, optionally narrowed by period and
    /// exact name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub fn aggregates(
        &self,
        kind: EventKind,
        period: Option<Period>,
        name: Option<&str>,
    ) -> Result<Vec<AggregateRow>> {
        Ok(rollup::load_rows(&self.conn, kind, period, name)?)
    }

    /// Pending raw rows per kind and aggregate rows per period.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if a count fails.
    pub fn info(&self) -> Result<StoreInfo> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT duration, COUNT(*) FROM aggregates GROUP BY duration ORDER BY duration",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let aggregates = counts
            .into_iter()
            .filter_map(|(duration, count)| {
                Period::from_duration(duration).map(|p| (p, u64::try_from(count).unwrap_or_default()))
            })
            .collect();

        Ok(StoreInfo {
            pending_counters: self.pending(EventKind::Counter)?,
            pending_gauges: self.pending(EventKind::Gauge)?,
            aggregates,
        })
    }
}

/// Validates and inserts one event. `None` means it was dropped as malformed.
fn record_on(conn: &Connection, event: &Event) -> rusqlite::Result<Option<usize>> {
    let at = event.at.unwrap_or_else(|| Utc::now().timestamp());
    if let Err(err) = raw::validate(&event.name, event.value, at) {
        tracing::warn!(kind = %event.kind, error = %err, "dropping malformed event");
        return Ok(None);
    }
    raw::insert(conn, event, at).map(Some)
}

fn decode_rows(
    stmt: &mut rusqlite::CachedStatement<'_>,
    params: &[&dyn ToSql],
    columns: &Arc<[Column]>,
) -> rusqlite::Result<Vec<Row>> {
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| row.get_ref(idx).map(|raw| column.kind.decode(raw)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push(Row::new(Arc::clone(columns), values));
    }
    Ok(out)
}
