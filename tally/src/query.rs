//! Typed rows returned by ad-hoc queries against the store.
//!
//! Every [`QueryResult`] carries a column descriptor: one [`Column`] per
//! result column, each with a declared [`ColumnType`]. Values are decoded
//! according to that type rather than to whatever SQLite happened to store.
//!
//! When no descriptor is supplied, the type is derived from the column name
//! ([`ColumnType::for_name`]): a `_at` suffix means timestamp, `_on` means
//! date. The store resolves this once per SQL text and reuses the result.
//!
//! # Example Usage
//!
//! ```rust
//! # use tally::Store;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::open_in_memory()?;
//! store.count("foo", 1.0, Some(1_393_762_211))?;
//! store.aggregate(&[])?;
//!
//! let result = store.select(
//!     "SELECT name, starts_at, value FROM aggregates WHERE period = ?1",
//!     &[&"day"],
//! )?;
//! for row in &result {
//!     let at = row.get("starts_at").and_then(|v| v.as_timestamp());
//!     println!("{:?} {:?}", row.get("name"), at);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::ValueRef;
use serde::Serialize;
use serde::ser::{SerializeMap, SerializeStruct};

/// Text layouts accepted when a timestamp or date column holds a string.
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// The declared semantic type of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Seconds since the epoch, or a `YYYY-MM-DD HH:MM:SS` string.
    Timestamp,
    /// A calendar date.
    Date,
    /// An integer or float.
    Number,
    /// Free text.
    Text,
    /// Whatever SQLite stored.
    Auto,
}

impl ColumnType {
    /// Derives a column type from its name.
    ///
    /// ```rust
    /// use tally::query::ColumnType;
    ///
    /// assert_eq!(ColumnType::for_name("starts_at"), ColumnType::Timestamp);
    /// assert_eq!(ColumnType::for_name("created_on"), ColumnType::Date);
    /// assert_eq!(ColumnType::for_name("value"), ColumnType::Auto);
    /// ```
    pub fn for_name(name: &str) -> Self {
        if name.ends_with("_at") {
            Self::Timestamp
        } else if name.ends_with("_on") {
            Self::Date
        } else {
            Self::Auto
        }
    }

    /// Decodes a raw SQLite value as this type.
    ///
    /// Values that cannot be interpreted as the declared type are returned as
    /// their stored type instead of failing the whole query.
    pub fn decode(self, raw: ValueRef<'_>) -> Value {
        let stored = Value::from(raw);
        match (self, stored) {
            (_, Value::Null) => Value::Null,
            (Self::Timestamp, stored) => stored.to_timestamp().map_or(stored, Value::Timestamp),
            (Self::Date, stored) => stored
                .to_timestamp()
                .map(|t| t.date_naive())
                .or_else(|| stored.as_str().and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok()))
                .map_or(stored, Value::Date),
            (Self::Number, Value::Text(s)) => match s.trim().parse::<f64>() {
                Ok(n) => Value::Real(n),
                Err(_) => Value::Text(s),
            },
            (Self::Text, Value::Integer(i)) => Value::Text(i.to_string()),
            (Self::Text, Value::Real(f)) => Value::Text(f.to_string()),
            (_, stored) => stored,
        }
    }
}

/// A named, typed result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    /// Column name as reported by SQLite.
    pub name: String,
    /// Declared type used to decode values.
    pub kind: ColumnType,
}

impl Column {
    /// Creates a column with an explicit type.
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Creates a column typed by [`ColumnType::for_name`].
    pub fn inferred(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = ColumnType::for_name(&name);
        Self { name, kind }
    }
}

/// A decoded cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Integer.
    Integer(i64),
    /// Float.
    Real(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// A point in time (UTC).
    Timestamp(DateTime<Utc>),
    /// A calendar date.
    Date(NaiveDate),
}

impl Value {
    /// The value as an integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as a float; integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// The value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a timestamp, if it was decoded as one.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// The value as a date, if it was decoded as one.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns true for SQL `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[allow(clippy::cast_possible_truncation)] // floor of a finite epoch second
    fn to_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Integer(i) => DateTime::from_timestamp(*i, 0),
            Self::Real(f) if f.is_finite() => DateTime::from_timestamp(f.floor() as i64, 0),
            Self::Text(s) => parse_datetime(s),
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

impl From<ValueRef<'_>> for Value {
    fn from(raw: ValueRef<'_>) -> Self {
        match raw {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(f) => Self::Real(f),
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Self::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
            Self::Date(d) => write!(f, "{d}"),
        }
    }
}

/// One result row: values in column order, sharing the result's descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row. `values` must be in the order of `columns`.
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Looks up a value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.values.get(idx)
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The shared column descriptor.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

impl Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(&column.name, value)?;
        }
        map.end()
    }
}

/// The rows of a query together with their column descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
}

impl QueryResult {
    /// Creates a result from a descriptor and decoded rows.
    pub fn new(columns: Arc<[Column]>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// The column descriptor.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The decoded rows.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the query matched nothing.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over the rows.
    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl Serialize for QueryResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("QueryResult", 2)?;
        state.serialize_field("columns", &*self.columns)?;
        state.serialize_field("rows", &self.rows)?;
        state.end()
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_for_name() {
        assert_eq!(ColumnType::for_name("starts_at"), ColumnType::Timestamp);
        assert_eq!(ColumnType::for_name("starts_on"), ColumnType::Date);
        assert_eq!(ColumnType::for_name("attic"), ColumnType::Auto);
        assert_eq!(ColumnType::for_name("name"), ColumnType::Auto);
    }

    #[test]
    fn test_decode_timestamp() {
        let expected = DateTime::from_timestamp(1_393_762_211, 0).unwrap();

        assert_eq!(
            ColumnType::Timestamp.decode(ValueRef::Integer(1_393_762_211)),
            Value::Timestamp(expected)
        );
        assert_eq!(
            ColumnType::Timestamp.decode(ValueRef::Text(b"2014-03-02 12:10:11")),
            Value::Timestamp(expected)
        );
        assert_eq!(
            ColumnType::Timestamp.decode(ValueRef::Real(1_393_762_211.7)),
            Value::Timestamp(expected)
        );
        // Unparseable text is kept as text
        assert_eq!(
            ColumnType::Timestamp.decode(ValueRef::Text(b"soon")),
            Value::Text("soon".to_string())
        );
        assert_eq!(ColumnType::Timestamp.decode(ValueRef::Null), Value::Null);
    }

    #[test]
    fn test_decode_date() {
        let day = NaiveDate::from_ymd_opt(2014, 3, 2).unwrap();

        assert_eq!(
            ColumnType::Date.decode(ValueRef::Integer(1_393_762_211)),
            Value::Date(day)
        );
        assert_eq!(
            ColumnType::Date.decode(ValueRef::Text(b"2014-03-02")),
            Value::Date(day)
        );
    }

    #[test]
    fn test_decode_number_and_text() {
        assert_eq!(
            ColumnType::Number.decode(ValueRef::Text(b" 1.5 ")),
            Value::Real(1.5)
        );
        assert_eq!(ColumnType::Number.decode(ValueRef::Integer(3)), Value::Integer(3));
        assert_eq!(
            ColumnType::Text.decode(ValueRef::Integer(3)),
            Value::Text("3".to_string())
        );
        assert_eq!(ColumnType::Auto.decode(ValueRef::Real(2.5)), Value::Real(2.5));
    }

    #[test]
    fn test_row_lookup_and_json() {
        let columns: Arc<[Column]> = vec![Column::inferred("name"), Column::inferred("starts_at")].into();
        let at = DateTime::from_timestamp(0, 0).unwrap();
        let row = Row::new(
            Arc::clone(&columns),
            vec![Value::Text("foo".into()), Value::Timestamp(at)],
        );

        assert_eq!(row.get("name").and_then(Value::as_str), Some("foo"));
        assert_eq!(row.get("starts_at").and_then(Value::as_timestamp), Some(at));
        assert!(row.get("missing").is_none());

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["name"], "foo");
        assert_eq!(json["starts_at"], "1970-01-01T00:00:00Z");
    }
}
