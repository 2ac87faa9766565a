//! Integration tests for the rollup engine through the public store API.
//!
//! All timestamps are UTC. The reference instants are
//! 2014-03-02 12:10:11 (a Sunday) and 14:10:11 on the same day.

use tally::{EventKind, Period, Store, Value};
use tempfile::tempdir;

const AT_12: i64 = 1_393_762_211;
const AT_14: i64 = 1_393_769_411;

const MINUTE_12: i64 = 1_393_762_200;
const MINUTE_14: i64 = 1_393_769_400;
const HOUR_12: i64 = 1_393_761_600;
const HOUR_14: i64 = 1_393_768_800;
const DAY: i64 = 1_393_718_400;
const WEEK: i64 = 1_393_200_000; // Monday 2014-02-24
const MONTH: i64 = 1_393_632_000; // 2014-03-01
const YEAR: i64 = 1_388_534_400; // 2014-01-01

type AggRow = (String, f64, String, i64);

/// Reads `name, value, period, starts_at` from the aggregates view.
fn aggregates(store: &mut Store, tail: &str) -> Vec<AggRow> {
    let sql = format!("SELECT name, value, period, starts_at FROM aggregates {tail}");
    store
        .select(&sql, &[])
        .unwrap()
        .iter()
        .map(|row| {
            (
                row.get("name").and_then(Value::as_str).unwrap().to_string(),
                row.get("value").and_then(Value::as_f64).unwrap(),
                row.get("period").and_then(Value::as_str).unwrap().to_string(),
                row.get("starts_at")
                    .and_then(Value::as_timestamp)
                    .unwrap()
                    .timestamp(),
            )
        })
        .collect()
}

fn row(name: &str, value: f64, period: &str, starts_at: i64) -> AggRow {
    (name.to_string(), value, period.to_string(), starts_at)
}

#[test]
fn test_counter_two_events() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("foo", 1.0, Some(AT_12)).unwrap();
    store.count("foo", 1.0, Some(AT_14)).unwrap();
    store
        .aggregate(&[Period::Minute, Period::Hour, Period::Day])
        .unwrap();

    assert_eq!(
        aggregates(&mut store, "ORDER BY duration, name, starts_at"),
        vec![
            row("foo", 1.0, "minute", MINUTE_12),
            row("foo", 1.0, "minute", MINUTE_14),
            row("foo", 1.0, "hour", HOUR_12),
            row("foo", 1.0, "hour", HOUR_14),
            row("foo", 2.0, "day", DAY),
        ]
    );

    let day = store
        .aggregates(EventKind::Counter, Some(Period::Day), Some("foo"))
        .unwrap();
    assert_eq!((day[0].sum, day[0].count), (2.0, 2));
}

#[test]
fn test_single_event_default_periods() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("foo", 1.0, Some(AT_12)).unwrap();
    store.aggregate(&[]).unwrap();

    assert_eq!(
        aggregates(&mut store, "ORDER BY duration, name"),
        vec![
            row("foo", 1.0, "minute", MINUTE_12),
            row("foo", 1.0, "hour", HOUR_12),
            row("foo", 1.0, "day", DAY),
            row("foo", 1.0, "week", WEEK),
            row("foo", 1.0, "month", MONTH),
            row("foo", 1.0, "year", YEAR),
        ]
    );
}

#[test]
fn test_raw_rows_fan_out_to_ancestors() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("foo", 1.0, Some(AT_12)).unwrap();
    store.count("foo.bar", 2.0, Some(AT_12)).unwrap();

    let raw = store
        .select("SELECT name, value, starts_at FROM counters ORDER BY name, value", &[])
        .unwrap();
    let raw: Vec<_> = raw
        .iter()
        .map(|r| {
            (
                r.get("name").and_then(Value::as_str).unwrap().to_string(),
                r.get("value").and_then(Value::as_f64).unwrap(),
                r.get("starts_at").and_then(Value::as_timestamp).unwrap().timestamp(),
            )
        })
        .collect();

    assert_eq!(
        raw,
        vec![
            ("foo".to_string(), 1.0, AT_12),
            ("foo".to_string(), 2.0, AT_12),
            ("foo.bar".to_string(), 2.0, AT_12),
        ]
    );
}

#[test]
fn test_combined_name_sums_into_parent() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("foo", 3.0, Some(AT_12)).unwrap();
    store.count("foo.bar", 2.0, Some(AT_12)).unwrap();
    store.aggregate(&[Period::Minute, Period::Hour]).unwrap();

    let expected = vec![
        row("foo", 5.0, "minute", MINUTE_12),
        row("foo.bar", 2.0, "minute", MINUTE_12),
        row("foo", 5.0, "hour", HOUR_12),
        row("foo.bar", 2.0, "hour", HOUR_12),
    ];
    assert_eq!(aggregates(&mut store, "ORDER BY duration, name"), expected);

    // A second pass with nothing pending changes nothing
    let report = store.aggregate(&[Period::Minute, Period::Hour]).unwrap();
    assert_eq!(report.raw_rows(), 0);
    assert_eq!(aggregates(&mut store, "ORDER BY duration, name"), expected);
}

#[test]
fn test_gauge_two_events_average() {
    let mut store = Store::open_in_memory().unwrap();
    store.gauge("foo", 1.0, Some(AT_12)).unwrap();
    store.gauge("foo", 2.0, Some(AT_14)).unwrap();
    store
        .aggregate(&[Period::Minute, Period::Hour, Period::Day])
        .unwrap();

    assert_eq!(
        aggregates(&mut store, "ORDER BY duration, name, starts_at"),
        vec![
            row("foo", 1.0, "minute", MINUTE_12),
            row("foo", 2.0, "minute", MINUTE_14),
            row("foo", 1.0, "hour", HOUR_12),
            row("foo", 2.0, "hour", HOUR_14),
            row("foo", 1.5, "day", DAY),
        ]
    );
}

#[test]
fn test_mixed_kinds() {
    let mut store = Store::open_in_memory().unwrap();
    store.gauge("foo", 1.0, Some(AT_12)).unwrap();
    store.gauge("foo", 2.0, Some(AT_14)).unwrap();
    store.count("bar", 1.0, Some(AT_12)).unwrap();
    store.count("bar", 2.0, Some(AT_14)).unwrap();
    store
        .aggregate(&[Period::Minute, Period::Hour, Period::Day])
        .unwrap();

    assert_eq!(
        aggregates(&mut store, "ORDER BY name, duration, starts_at"),
        vec![
            row("bar", 1.0, "minute", MINUTE_12),
            row("bar", 2.0, "minute", MINUTE_14),
            row("bar", 1.0, "hour", HOUR_12),
            row("bar", 2.0, "hour", HOUR_14),
            row("bar", 3.0, "day", DAY),
            row("foo", 1.0, "minute", MINUTE_12),
            row("foo", 2.0, "minute", MINUTE_14),
            row("foo", 1.0, "hour", HOUR_12),
            row("foo", 2.0, "hour", HOUR_14),
            row("foo", 1.5, "day", DAY),
        ]
    );
}

#[test]
fn test_counter_additivity_across_batches() {
    let events = [
        ("a.x", 1.0, AT_12),
        ("a.y", 4.0, AT_12 + 30),
        ("a.x", 2.0, AT_14),
        ("b", 8.0, AT_14 + 86_400),
    ];

    let mut once = Store::open_in_memory().unwrap();
    for (name, value, at) in events {
        once.count(name, value, Some(at)).unwrap();
    }
    once.aggregate(&[]).unwrap();

    let mut split = Store::open_in_memory().unwrap();
    for chunk in events.chunks(1) {
        for &(name, value, at) in chunk {
            split.count(name, value, Some(at)).unwrap();
        }
        split.aggregate(&[]).unwrap();
    }

    let totals = |store: &Store| {
        store
            .aggregates(EventKind::Counter, None, None)
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.starts_at, r.duration, r.sum, r.count))
            .collect::<Vec<_>>()
    };
    assert_eq!(totals(&once), totals(&split));
    assert!(!totals(&once).is_empty());
}

#[test]
fn test_out_of_range_sums_do_not_block_later_passes() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("big", 1e308, Some(AT_12)).unwrap();
    store.count("big", 1e308, Some(AT_12)).unwrap();
    store.aggregate(&[Period::Day]).unwrap();

    store.count("big", -1e308, Some(AT_14)).unwrap();
    store.count("big", -1e308, Some(AT_14)).unwrap();
    store.count("innocent", 1.0, Some(AT_14)).unwrap();
    let report = store.aggregate(&[Period::Day]).unwrap();
    assert_eq!(report.counters.overflowed, 1);

    store.count("innocent", 1.0, Some(AT_14)).unwrap();
    store.aggregate(&[Period::Day]).unwrap();

    assert_eq!(store.pending(EventKind::Counter).unwrap(), 0);
    assert_eq!(
        aggregates(&mut store, "WHERE name = 'innocent'"),
        vec![row("innocent", 2.0, "day", DAY)]
    );
    assert!(aggregates(&mut store, "WHERE name = 'big'").is_empty());
}

#[test]
fn test_gauge_average_across_batches() {
    let mut store = Store::open_in_memory().unwrap();
    store.gauge("load", 1.0, Some(AT_12)).unwrap();
    store.aggregate(&[Period::Day]).unwrap();
    store.gauge("load", 2.0, Some(AT_14)).unwrap();
    store.aggregate(&[Period::Day]).unwrap();

    let day = store
        .aggregates(EventKind::Gauge, Some(Period::Day), Some("load"))
        .unwrap();
    assert_eq!(day.len(), 1);
    assert_eq!((day[0].sum, day[0].count, day[0].value), (3.0, 2, 1.5));
}

#[test]
fn test_subset_of_periods_consumes_raw_rows() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("foo", 1.0, Some(AT_12)).unwrap();
    store.aggregate(&[Period::Minute]).unwrap();
    store.aggregate(&[Period::Day]).unwrap();

    assert_eq!(
        store
            .aggregates(EventKind::Counter, Some(Period::Minute), None)
            .unwrap()
            .len(),
        1
    );
    assert!(
        store
            .aggregates(EventKind::Counter, Some(Period::Day), None)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_second_period_is_opt_in() {
    let mut store = Store::open_in_memory().unwrap();
    store.count("foo", 1.0, Some(AT_12)).unwrap();
    store.count("foo", 1.0, Some(AT_12 + 1)).unwrap();
    store.aggregate(&[Period::Second]).unwrap();

    let seconds = store
        .aggregates(EventKind::Counter, Some(Period::Second), Some("foo"))
        .unwrap();
    let starts: Vec<_> = seconds.iter().map(|r| r.starts_at).collect();
    assert_eq!(starts, vec![AT_12, AT_12 + 1]);
}

#[test]
fn test_aggregates_persist_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.db");

    {
        let mut store = Store::open(&path).unwrap();
        store.count("foo", 1.0, Some(AT_12)).unwrap();
        store.aggregate(&[Period::Day]).unwrap();
    }
    {
        let mut store = Store::open(&path).unwrap();
        store.count("foo", 1.0, Some(AT_14)).unwrap();
        store.aggregate(&[Period::Day]).unwrap();
    }

    let store = Store::open_readonly(&path).unwrap();
    let day = store
        .aggregates(EventKind::Counter, Some(Period::Day), Some("foo"))
        .unwrap();
    assert_eq!((day[0].value, day[0].count), (2.0, 2));
}
