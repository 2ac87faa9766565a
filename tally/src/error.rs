//! Error types for the tally metrics store.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::ErrorCode;

use thiserror::Error;

use crate::event::EventKind;

/// The main error type for all tally operations.
///
/// Each variant wraps the error enum of one concern, so callers can match on
/// the broad category and still reach the detailed cause.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Error opening, initializing, or talking to the store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An event was rejected before reaching the raw tables.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// A rollup pass failed and was rolled back.
    #[error("rollup error: {0}")]
    Rollup(#[from] RollupError),

    /// A protocol line could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A period name could not be resolved.
    #[error("period error: {0}")]
    Period(#[from] PeriodError),

    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The ingestion server failed.
    #[error("server error: {0}")]
    Server(#[from] ServerError),
}

/// Errors raised by the storage layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying SQLite engine reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database file could not be opened.
    #[error("failed to open database '{}': {source}", path.display())]
    Open {
        /// The database path.
        path: PathBuf,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// A write was attempted on a store opened read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),

    /// A flush pass hit a failure that retrying will not fix.
    ///
    /// The ingestion server stops when it sees one.
    #[error("unrecoverable storage failure: {0}")]
    Fatal(#[source] Arc<TallyError>),
}

/// Errors describing a malformed event.
///
/// These never abort a batch: [`Store::record`](crate::Store::record) logs
/// and drops the offending event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// The metric name is empty, has an empty segment, or contains whitespace.
    #[error("invalid metric name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The value is NaN or infinite.
    #[error("invalid value {value} for metric {name:?}")]
    InvalidValue {
        /// The metric name.
        name: String,
        /// The rejected value.
        value: f64,
    },

    /// The timestamp cannot be mapped onto a calendar date.
    #[error("timestamp {at} is outside the supported range")]
    InvalidTimestamp {
        /// The rejected timestamp, in seconds since the epoch.
        at: i64,
    },
}

/// A rollup pass for one event kind failed.
#[derive(Error, Debug)]
#[error("rollup of {kind} failed: {source}")]
pub struct RollupError {
    /// The kind whose transaction was rolled back.
    pub kind: EventKind,
    /// The storage failure that aborted the pass.
    #[source]
    pub source: rusqlite::Error,
}

/// Errors raised while parsing a protocol line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line had fewer than three fields.
    #[error("missing {field} in line {line:?}")]
    MissingField {
        /// The name of the absent field.
        field: &'static str,
        /// The offending line.
        line: String,
    },

    /// The table token is neither `counters` nor `gauges`.
    #[error("unknown table {0:?}")]
    UnknownTable(String),

    /// The value token is not a finite number.
    #[error("invalid value {0:?}")]
    InvalidValue(String),

    /// The timestamp token is not an integer.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Errors resolving a period.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    /// No period has this name.
    #[error("unknown period {0:?} (expected year, month, week, day, hour, minute or second)")]
    Unknown(String),
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`ServerConfig`](crate::ServerConfig).
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A listen address could not be understood.
    #[error("invalid listen address {0:?} (expected tcp://host:port or unix:///path)")]
    InvalidListen(String),

    /// A field holds a value outside its allowed range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised by the ingestion server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading from or writing to a connection failed.
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The listen address is not supported on this platform.
    #[error("unsupported listen address {0}")]
    Unsupported(String),
}

impl TallyError {
    /// Returns true for storage failures that a later pass cannot recover
    /// from: I/O, corruption, a full disk, a missing table, a panicked task.
    ///
    /// Busy/locked databases, constraint violations and anything outside the
    /// storage layer are treated as recoverable.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Store(StoreError::Sqlite(err)) => sqlite_unrecoverable(err),
            Self::Store(
                StoreError::Open { .. } | StoreError::ReadOnly | StoreError::Task(_) | StoreError::Fatal(_),
            ) => true,
            Self::Rollup(err) => sqlite_unrecoverable(&err.source),
            _ => false,
        }
    }
}

fn sqlite_unrecoverable(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => !matches!(
            failure.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::ConstraintViolation
                | ErrorCode::OperationInterrupted
        ),
        _ => false,
    }
}

impl From<rusqlite::Error> for TallyError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(err))
    }
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;
