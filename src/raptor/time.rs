use bytemuck::{Pod, Zeroable};
use chrono::{Days, NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

/// Longest supported date range. All minutes of the range plus one day of lead-in and two days
/// of overnight trips have to fit into an `i16`.
pub const MAX_DATE_RANGE_DAYS: u64 = 20;

pub const MINUTES_PER_DAY: i32 = 24 * 60;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("Could not parse date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Date range {from}..{to} is empty")]
    EmptyRange { from: NaiveDate, to: NaiveDate },
    #[error("Date range {from}..{to} spans {days} days, at most {MAX_DATE_RANGE_DAYS} are supported")]
    RangeTooLong {
        from: NaiveDate,
        to: NaiveDate,
        days: u64,
    },
}

pub fn parse_date(value: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| TimeError::InvalidDate(value.to_string()))
}

/// Minutes relative to midnight UTC of a timetable's base day.
///
/// [`DeltaTime::INVALID`] is the largest representable value, so it orders after every real time
/// and never wins an earliest-arrival comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct DeltaTime {
    minutes: i16,
}

impl Default for DeltaTime {
    fn default() -> Self {
        DeltaTime::INVALID
    }
}

impl DeltaTime {
    pub const INVALID: DeltaTime = DeltaTime { minutes: i16::MAX };

    #[inline]
    pub const fn from_minutes(minutes: i16) -> DeltaTime {
        DeltaTime { minutes }
    }

    /// Returns `None` if the value does not fit or collides with the sentinel.
    pub fn checked_from_minutes(minutes: i64) -> Option<DeltaTime> {
        let minutes = i16::try_from(minutes).ok()?;
        if minutes == i16::MAX {
            None
        } else {
            Some(DeltaTime { minutes })
        }
    }

    pub fn from_day_and_minute(day: i32, minute: i32) -> Option<DeltaTime> {
        Self::checked_from_minutes(day as i64 * MINUTES_PER_DAY as i64 + minute as i64)
    }

    /// Converts a UTC wall-clock time into minutes since midnight of `base_day`. Seconds are
    /// truncated.
    pub fn from_utc(base_day: NaiveDate, utc: NaiveDateTime) -> Option<DeltaTime> {
        let midnight = base_day.and_hms_opt(0, 0, 0)?;
        Self::checked_from_minutes(utc.signed_duration_since(midnight).num_minutes())
    }

    #[inline]
    pub fn minutes(&self) -> i16 {
        self.minutes
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.minutes != i16::MAX
    }

    /// Day relative to the base day, which may be negative for the lead-in day.
    #[inline]
    pub fn day(&self) -> i32 {
        (self.minutes as i32).div_euclid(MINUTES_PER_DAY)
    }

    #[inline]
    pub fn minute_of_day(&self) -> i32 {
        (self.minutes as i32).rem_euclid(MINUTES_PER_DAY)
    }

    /// Adds a duration. The sentinel absorbs, and overflowing results become the sentinel.
    #[inline]
    pub fn plus_minutes(&self, minutes: u16) -> DeltaTime {
        if !self.is_valid() {
            return DeltaTime::INVALID;
        }
        self.minutes
            .checked_add_unsigned(minutes)
            .map(DeltaTime::from_minutes)
            .unwrap_or(DeltaTime::INVALID)
    }

    #[inline]
    pub fn minus_minutes(&self, minutes: u16) -> DeltaTime {
        if !self.is_valid() {
            return DeltaTime::INVALID;
        }
        self.minutes
            .checked_sub_unsigned(minutes)
            .map(DeltaTime::from_minutes)
            .unwrap_or(DeltaTime::INVALID)
    }

    pub fn naive_date_time(&self, base_day: NaiveDate) -> Option<NaiveDateTime> {
        if !self.is_valid() {
            return None;
        }
        base_day
            .and_hms_opt(0, 0, 0)?
            .checked_add_signed(TimeDelta::minutes(self.minutes as i64))
    }

    pub fn to_unix(&self, base_day: NaiveDate) -> Option<i64> {
        self.naive_date_time(base_day)
            .map(|date_time| date_time.and_utc().timestamp())
    }
}

/// Half-open range of service dates `[from, to)`. The first day is the base day of every
/// [`DeltaTime`] in a timetable built for this range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<DateRange, TimeError> {
        if to <= from {
            return Err(TimeError::EmptyRange { from, to });
        }
        let days = to.signed_duration_since(from).num_days() as u64;
        if days > MAX_DATE_RANGE_DAYS {
            return Err(TimeError::RangeTooLong { from, to, days });
        }
        Ok(DateRange { from, to })
    }

    #[inline]
    pub fn from(&self) -> NaiveDate {
        self.from
    }

    #[inline]
    pub fn to(&self) -> NaiveDate {
        self.to
    }

    #[inline]
    pub fn base_day(&self) -> NaiveDate {
        self.from
    }

    pub fn days(&self) -> u64 {
        self.to.signed_duration_since(self.from).num_days() as u64
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.from <= date && date < self.to
    }

    /// First minute after the range.
    pub fn end(&self) -> DeltaTime {
        DeltaTime::from_minutes((self.days() as i32 * MINUTES_PER_DAY) as i16)
    }

    pub fn contains(&self, time: DeltaTime) -> bool {
        time.is_valid() && time.minutes() >= 0 && time < self.end()
    }

    /// Dates of the range, starting `lead_in_days` before the first day.
    pub fn dates_with_lead_in(&self, lead_in_days: u64) -> impl Iterator<Item = NaiveDate> {
        let first = self.from.checked_sub_days(Days::new(lead_in_days));
        let to = self.to;
        first
            .into_iter()
            .flat_map(|first| first.iter_days())
            .take_while(move |date| *date < to)
    }
}
