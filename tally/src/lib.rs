//! # tally
//!
//! Compact time-series metrics store with rollup aggregation, backed by SQLite.
//!
//! Clients report **counter** and **gauge** events under dotted names. Every
//! event is also counted under each ancestor name (`web.hits.home` feeds
//! `web.hits` and `web`). Raw events are periodically rolled up into year,
//! month, week, day, hour and minute buckets, and the rolled-up rows can be
//! queried with plain SQL.
//!
//! ## Key Properties
//!
//! - Rollups are idempotent and additive: splitting a stream into batches
//!   gives the same aggregates as one big batch
//! - Counters keep the sum, gauges the running mean (`sum` and `count` are
//!   stored, so merges stay exact)
//! - The ingestion server never touches storage on its accepting path; at
//!   most one commit+rollup pass runs at a time
//!
//! ## Quick Start
//!
//! ```rust
//! use tally::{EventKind, Period, Store};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::open_in_memory()?;
//!
//! // 2014-03-02 10:10:11 and 12:10:11 UTC
//! store.count("foo", 1.0, Some(1_393_755_011))?;
//! store.count("foo", 1.0, Some(1_393_762_211))?;
//! store.aggregate(&[])?;
//!
//! let days = store.aggregates(EventKind::Counter, Some(Period::Day), Some("foo"))?;
//! assert_eq!((days[0].sum, days[0].count), (2.0, 2));
//!
//! let hours = store.aggregates(EventKind::Counter, Some(Period::Hour), Some("foo"))?;
//! assert_eq!(hours.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Store`]: Owns the SQLite connection; record, aggregate, query
//! - [`Period`]: Aggregation granularities and bucket alignment
//! - [`IngestBuffer`] / [`FlushCoordinator`]: Buffered, single-flight flushing
//! - [`Server`]: Line-protocol listener over TCP or Unix sockets
//! - [`QueryResult`]: Typed rows with a column descriptor
//!
//! ## Modules
//!
//! - [`period`]: Period table and bucket starts
//! - [`name`]: Dotted-name expansion and validation
//! - [`event`]: Event kinds and events
//! - [`schema`]: Tables, indexes, view and pragmas
//! - [`raw`]: Raw event tables
//! - [`rollup`]: The rollup engine
//! - [`query`]: Typed query rows
//! - [`store`]: The store handle
//! - [`buffer`]: The ingestion buffer
//! - [`flush`]: Flush coordination and the timer
//! - [`protocol`]: Wire protocol parsing and encoding
//! - [`server`]: The ingestion server
//! - [`client`]: Writing to a running server
//! - [`config`]: Server configuration
//! - [`error`]: Error types

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod flush;
pub mod name;
pub mod period;
pub mod protocol;
pub mod query;
pub mod raw;
pub mod rollup;
pub mod schema;
pub mod server;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use buffer::IngestBuffer;
pub use client::LineClient;
pub use config::{ListenAddr, ServerConfig};
pub use error::{Result, TallyError};
pub use event::{Event, EventKind};
pub use flush::{FlushCoordinator, FlushOptions, FlushOutcome, FlushReport};
pub use period::Period;
pub use query::{Column, ColumnType, QueryResult, Row, Value};
pub use rollup::{AggregateRow, RollupReport};
pub use server::{Listener, Server, ServerState};
pub use store::{BatchSummary, Store};
