//! The newline-delimited wire protocol.
//!
//! ```text
//! <table> <name> <value> [<unix-timestamp>]
//!
//! counters web.hits 1
//! gauges   web.load 0.75 1393762211
//! SHUTDOWN:SERVER
//! ```
//!
//! `<table>` is `counters` or `gauges`. Tokens are separated by any run of
//! whitespace and tokens after the timestamp are ignored. A missing timestamp
//! means "when received". Blank lines carry nothing.

use crate::error::ProtocolError;
use crate::event::{Event, EventKind};

/// The line that asks a server to drain and stop.
pub const SHUTDOWN_SENTINEL: &str = "SHUTDOWN:SERVER";

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// Empty or whitespace-only.
    Blank,
    /// The shutdown sentinel.
    Shutdown,
    /// An event, with its timestamp resolved.
    Event(Event),
}

/// Parses one line. `received_at` fills in a missing timestamp.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for an unknown table, a missing field, a
/// non-finite value or a non-integer timestamp.
///
/// # Examples
///
/// ```rust
/// use tally::protocol::{Line, parse_line};
/// use tally::Event;
///
/// let line = parse_line("gauges web.load 0.75", 1_393_762_211).unwrap();
/// assert_eq!(line, Line::Event(Event::gauge("web.load", 0.75, Some(1_393_762_211))));
/// ```
pub fn parse_line(line: &str, received_at: i64) -> Result<Line, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Line::Blank);
    }
    if trimmed == SHUTDOWN_SENTINEL {
        return Ok(Line::Shutdown);
    }

    let mut tokens = trimmed.split_whitespace();
    let missing = |field| ProtocolError::MissingField {
        field,
        line: trimmed.to_string(),
    };

    let table = tokens.next().ok_or_else(|| missing("table"))?;
    let kind = EventKind::from_table(table).ok_or_else(|| ProtocolError::UnknownTable(table.to_string()))?;
    let name = tokens.next().ok_or_else(|| missing("name"))?;
    let value_token = tokens.next().ok_or_else(|| missing("value"))?;

    let value = value_token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::InvalidValue(value_token.to_string()))?;

    let at = match tokens.next() {
        Some(token) => token
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidTimestamp(token.to_string()))?,
        None => received_at,
    };

    Ok(Line::Event(Event {
        kind,
        name: name.to_string(),
        value,
        at: Some(at),
    }))
}

/// Formats an event as a protocol line, without the trailing newline.
///
/// ```rust
/// use tally::protocol::encode;
/// use tally::Event;
///
/// assert_eq!(encode(&Event::counter("a.b", 2.0, Some(60))), "counters a.b 2 60");
/// assert_eq!(encode(&Event::counter("a.b", 0.5, None)), "counters a.b 0.5");
/// ```
pub fn encode(event: &Event) -> String {
    let table = event.kind.raw_table();
    match event.at {
        Some(at) => format!("{table} {} {} {at}", event.name, event.value),
        None => format!("{table} {} {}", event.name, event.value),
    }
}
