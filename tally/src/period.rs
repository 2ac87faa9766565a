//! Aggregation periods and their bucket alignment.
//!
//! Every aggregate row is keyed by the period's nominal duration in seconds.
//! Durations for `month` and `year` are fixed approximations (30 and 365
//! days); they identify the period and are never used for calendar math.
//! Bucket boundaries are computed in UTC.
//!
//! ```rust
//! use tally::Period;
//!
//! // 2014-03-02 12:10:11 UTC, a Sunday
//! let at = 1_393_762_211;
//! assert_eq!(Period::Minute.bucket_start(at), 1_393_762_200); // 12:10:00
//! assert_eq!(Period::Day.bucket_start(at), 1_393_718_400); // 2014-03-02
//! assert_eq!(Period::Week.bucket_start(at), 1_393_200_000); // Monday 2014-02-24
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::PeriodError;

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;
const WEEK: i64 = 604_800;

/// The epoch (1970-01-01) was a Thursday: three days after a Monday.
const EPOCH_DAYS_FROM_MONDAY: i64 = 3;

/// A named granularity for time bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Calendar year, starting January 1st.
    Year,
    /// Calendar month, starting on the 1st.
    Month,
    /// ISO week, starting on Monday.
    Week,
    /// Calendar day.
    Day,
    /// Clock hour.
    Hour,
    /// Clock minute.
    Minute,
    /// Single second. Not part of [`Period::DEFAULT`].
    Second,
}

impl Period {
    /// Every period, coarsest first.
    pub const ALL: [Period; 7] = [
        Period::Year,
        Period::Month,
        Period::Week,
        Period::Day,
        Period::Hour,
        Period::Minute,
        Period::Second,
    ];

    /// The periods aggregated when none are requested explicitly.
    ///
    /// `second` is left out: it produces one aggregate row per event per name.
    pub const DEFAULT: [Period; 6] = [
        Period::Year,
        Period::Month,
        Period::Week,
        Period::Day,
        Period::Hour,
        Period::Minute,
    ];

    /// The nominal length of this period in seconds.
    ///
    /// This is the value stored in the `duration` column.
    pub const fn duration(self) -> i64 {
        match self {
            Self::Year => 31_536_000,
            Self::Month => 2_592_000,
            Self::Week => WEEK,
            Self::Day => DAY,
            Self::Hour => HOUR,
            Self::Minute => MINUTE,
            Self::Second => 1,
        }
    }

    /// The lowercase name stored in the `period` column.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Week => "week",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }

    /// Looks up a period by its nominal duration.
    pub fn from_duration(duration: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.duration() == duration)
    }

    /// Aligns a UNIX timestamp to the start of the bucket containing it.
    ///
    /// Timestamps outside chrono's calendar range cannot be aligned to months
    /// or years; they fall back to fixed-length alignment. The store rejects
    /// such timestamps before they are recorded.
    pub fn bucket_start(self, at: i64) -> i64 {
        match self {
            Self::Second => at,
            Self::Minute | Self::Hour | Self::Day => floor_to(at, self.duration()),
            Self::Week => {
                let day = at.div_euclid(DAY);
                let weekday = (day + EPOCH_DAYS_FROM_MONDAY).rem_euclid(7);
                (day - weekday) * DAY
            }
            Self::Month => calendar_start(at, |date| date.with_day(1))
                .unwrap_or_else(|| floor_to(at, self.duration())),
            Self::Year => calendar_start(at, |date| NaiveDate::from_ymd_opt(date.year(), 1, 1))
                .unwrap_or_else(|| floor_to(at, self.duration())),
        }
    }

    /// Parses a comma-separated list such as `"minute,hour,day"`.
    ///
    /// Blank entries are skipped, so an empty string yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`PeriodError::Unknown`] for the first unrecognised name.
    pub fn parse_list(list: &str) -> Result<Vec<Period>, PeriodError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

fn floor_to(at: i64, step: i64) -> i64 {
    at.div_euclid(step) * step
}

fn calendar_start(at: i64, truncate: impl FnOnce(NaiveDate) -> Option<NaiveDate>) -> Option<i64> {
    let date = DateTime::from_timestamp(at, 0)?.date_naive();
    let start = truncate(date)?.and_hms_opt(0, 0, 0)?;
    Some(start.and_utc().timestamp())
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| PeriodError::Unknown(s.to_string()))
    }
}
