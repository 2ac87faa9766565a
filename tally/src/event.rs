//! Raw counter and gauge events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The two kinds of metric a client can report.
///
/// The kind selects both the raw table an event lands in and the way its
/// aggregates derive `value` from `sum` and `count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Additive events: the aggregate value is the sum.
    Counter,
    /// Sampled levels: the aggregate value is the running mean.
    Gauge,
}

impl EventKind {
    /// Both kinds, in rollup order.
    pub const ALL: [EventKind; 2] = [EventKind::Counter, EventKind::Gauge];

    /// The raw table holding pending events of this kind.
    ///
    /// This is also the table token used by the line protocol.
    pub const fn raw_table(self) -> &'static str {
        match self {
            Self::Counter => "counters",
            Self::Gauge => "gauges",
        }
    }

    /// The table holding aggregates of this kind.
    pub const fn aggregate_table(self) -> &'static str {
        match self {
            Self::Counter => "aggregated_counters",
            Self::Gauge => "aggregated_gauges",
        }
    }

    /// Resolves a protocol table token.
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.raw_table() == table)
    }

    /// Derives the aggregate value from an accumulated sum and count.
    #[allow(clippy::cast_precision_loss)] // counts beyond 2^52 are not realistic
    pub fn value(self, sum: f64, count: i64) -> f64 {
        match self {
            Self::Counter => sum,
            Self::Gauge if count == 0 => f64::NAN,
            Self::Gauge => sum / count as f64,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        })
    }
}

/// A single reported data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Counter or gauge.
    pub kind: EventKind,
    /// Dotted metric name.
    pub name: String,
    /// Reported value.
    pub value: f64,
    /// Seconds since the epoch; `None` means "when recorded".
    pub at: Option<i64>,
}

impl Event {
    /// Creates a counter event.
    pub fn counter(name: impl Into<String>, value: f64, at: Option<i64>) -> Self {
        Self {
            kind: EventKind::Counter,
            name: name.into(),
            value,
            at,
        }
    }

    /// Creates a gauge event.
    pub fn gauge(name: impl Into<String>, value: f64, at: Option<i64>) -> Self {
        Self {
            kind: EventKind::Gauge,
            name: name.into(),
            value,
            at,
        }
    }
}
