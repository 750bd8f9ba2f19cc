//! Month-precision dates and inclusive date ranges
//!
//! Subscriptions are priced per month, so their boundaries are exchanged as
//! `MM-YYYY`. Internally a [`MonthDate`] is the first day of its month, which
//! keeps full-date arithmetic available for overlap calculations.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors related to temporal parsing and construction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemporalError {
    #[error("Invalid month date '{0}': expected MM-YYYY")]
    InvalidMonthDate(String),

    #[error("Month out of range: {0}")]
    MonthOutOfRange(u32),
}

/// A calendar month, stored as the first day of that month
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthDate(NaiveDate);

impl MonthDate {
    /// Creates a month date from a year and a 1-based month
    pub fn new(year: i32, month: u32) -> Result<Self, TemporalError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(MonthDate)
            .ok_or(TemporalError::MonthOutOfRange(month))
    }

    /// Truncates a full date to its month
    pub fn from_date(date: NaiveDate) -> Self {
        // Day 1 exists in every month chrono can represent.
        MonthDate(date.with_day(1).unwrap_or(date))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// First day of the month
    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// Last day of the month
    pub fn last_day(&self) -> NaiveDate {
        self.0
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(self.0)
    }
}

impl From<NaiveDate> for MonthDate {
    fn from(date: NaiveDate) -> Self {
        MonthDate::from_date(date)
    }
}

impl From<MonthDate> for NaiveDate {
    fn from(month: MonthDate) -> Self {
        month.0
    }
}

impl fmt::Display for MonthDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:04}", self.month(), self.year())
    }
}

impl FromStr for MonthDate {
    type Err = TemporalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TemporalError::InvalidMonthDate(s.to_string());

        let (month, year) = s.split_once('-').ok_or_else(invalid)?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if month.len() != 2 || year.len() != 4 || !digits(month) || !digits(year) {
            return Err(invalid());
        }
        let month: u32 = month.parse().map_err(|_| invalid())?;
        let year: i32 = year.parse().map_err(|_| invalid())?;

        MonthDate::new(year, month)
    }
}

impl Serialize for MonthDate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MonthDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A date range with both ends inclusive
///
/// Construction does not reject `from > to`; such a range is simply empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Range covering whole months from the start of `from` to the end of `to`
    pub fn months(from: MonthDate, to: MonthDate) -> Self {
        Self {
            from: from.first_day(),
            to: to.last_day(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    /// Number of days covered, counting both ends; zero when empty
    pub fn days(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            (self.to - self.from).num_days() + 1
        }
    }

    /// Intersection with another inclusive range; possibly empty
    pub fn intersect(&self, other: &DateRange) -> DateRange {
        DateRange {
            from: self.from.max(other.from),
            to: self.to.min(other.to),
        }
    }
}
