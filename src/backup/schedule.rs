//! Backup schedule computation
//!
//! Time is divided into buckets of `multiple` units aligned to the Unix epoch
//! in UTC (weeks start on Monday, months and years on calendar boundaries).
//! A scheduled run happens `start_offset_minutes` after the start of each
//! bucket.

use crate::{Error, Result};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Calendar unit of a schedule interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl ScheduleUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleUnit::Hour => "hour",
            ScheduleUnit::Day => "day",
            ScheduleUnit::Week => "week",
            ScheduleUnit::Month => "month",
            ScheduleUnit::Year => "year",
        }
    }
}

/// `multiple` x `unit`, e.g. `"1day"` or `"12hour"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleInterval {
    pub unit: ScheduleUnit,
    pub multiple: u32,
}

impl ScheduleInterval {
    pub fn new(unit: ScheduleUnit, multiple: u32) -> Result<Self> {
        if multiple == 0 {
            return Err(Error::Config("schedule interval multiple must be positive".to_string()));
        }
        Ok(Self { unit, multiple })
    }

    pub fn daily() -> Self {
        Self {
            unit: ScheduleUnit::Day,
            multiple: 1,
        }
    }

    /// Minutes in the shortest possible bucket (28-day months, 365-day years).
    pub fn min_bucket_minutes(&self) -> i64 {
        let unit = match self.unit {
            ScheduleUnit::Hour => 60,
            ScheduleUnit::Day => 24 * 60,
            ScheduleUnit::Week => 7 * 24 * 60,
            ScheduleUnit::Month => 28 * 24 * 60,
            ScheduleUnit::Year => 365 * 24 * 60,
        };
        unit * self.multiple as i64
    }

    /// The start offset must land inside every bucket.
    pub fn validate_offset(&self, start_offset_minutes: u32) -> Result<()> {
        if start_offset_minutes as i64 >= self.min_bucket_minutes() {
            return Err(Error::Config(format!(
                "start offset of {} minutes does not fit in a {} interval",
                start_offset_minutes, self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.multiple, self.unit.as_str())
    }
}

impl FromStr for ScheduleInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().to_ascii_lowercase();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, unit) = raw.split_at(split);

        let multiple = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<u32>()
                .map_err(|e| Error::Config(format!("invalid schedule interval '{}': {}", s, e)))?
        };
        let unit = match unit.trim().trim_end_matches('s') {
            "hour" => ScheduleUnit::Hour,
            "day" => ScheduleUnit::Day,
            "week" => ScheduleUnit::Week,
            "month" => ScheduleUnit::Month,
            "year" => ScheduleUnit::Year,
            other => {
                return Err(Error::Config(format!(
                    "invalid schedule interval unit '{}', expected one of [hour, day, week, month, year]",
                    other
                )))
            }
        };
        Self::new(unit, multiple)
    }
}

impl TryFrom<String> for ScheduleInterval {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScheduleInterval> for String {
    fn from(value: ScheduleInterval) -> Self {
        value.to_string()
    }
}

/// Pure schedule arithmetic; every function takes `now` explicitly.
pub struct ScheduleCalculator;

impl ScheduleCalculator {
    /// The next scheduled instant strictly after `now`.
    pub fn next_run(
        interval: &ScheduleInterval,
        start_offset_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        interval.validate_offset(start_offset_minutes)?;
        let offset = Duration::minutes(start_offset_minutes as i64);
        let bucket = Self::bucket_index(interval, now);
        let coming = Self::bucket_start(interval, bucket)? + offset;
        if coming > now {
            return Ok(coming);
        }
        Ok(Self::bucket_start(interval, bucket + interval.multiple as i64)? + offset)
    }

    /// The latest scheduled instant at or before `now`.
    pub fn last_run(
        interval: &ScheduleInterval,
        start_offset_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        interval.validate_offset(start_offset_minutes)?;
        let offset = Duration::minutes(start_offset_minutes as i64);
        let bucket = Self::bucket_index(interval, now);
        let current = Self::bucket_start(interval, bucket)? + offset;
        if current <= now {
            return Ok(current);
        }
        Ok(Self::bucket_start(interval, bucket - interval.multiple as i64)? + offset)
    }

    /// Start of the bucket containing `now`.
    pub fn current_bucket_start(
        interval: &ScheduleInterval,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        Self::bucket_start(interval, Self::bucket_index(interval, now))
    }

    /// Index (in units since the epoch) of the first unit of the bucket
    /// containing `now`.
    fn bucket_index(interval: &ScheduleInterval, now: DateTime<Utc>) -> i64 {
        let secs = now.timestamp();
        let units = match interval.unit {
            ScheduleUnit::Hour => secs.div_euclid(3600),
            ScheduleUnit::Day => secs.div_euclid(86_400),
            // 1970-01-01 was a Thursday; shift so that weeks begin on Monday
            ScheduleUnit::Week => (secs.div_euclid(86_400) + 3).div_euclid(7),
            ScheduleUnit::Month => (now.year() as i64 - 1970) * 12 + now.month0() as i64,
            ScheduleUnit::Year => now.year() as i64 - 1970,
        };
        units - units.rem_euclid(interval.multiple as i64)
    }

    fn bucket_start(interval: &ScheduleInterval, index: i64) -> Result<DateTime<Utc>> {
        let out_of_range = || Error::Config(format!("schedule bucket {} of {} out of range", index, interval));
        match interval.unit {
            ScheduleUnit::Hour => Utc.timestamp_opt(index * 3600, 0).single().ok_or_else(out_of_range),
            ScheduleUnit::Day => Utc.timestamp_opt(index * 86_400, 0).single().ok_or_else(out_of_range),
            ScheduleUnit::Week => Utc
                .timestamp_opt((index * 7 - 3) * 86_400, 0)
                .single()
                .ok_or_else(out_of_range),
            ScheduleUnit::Month => {
                let year = 1970 + index.div_euclid(12);
                let month = index.rem_euclid(12) as u32 + 1;
                first_instant(year, month).ok_or_else(out_of_range)
            }
            ScheduleUnit::Year => first_instant(1970 + index, 1).ok_or_else(out_of_range),
        }
    }
}

fn first_instant(year: i64, month: u32) -> Option<DateTime<Utc>> {
    let year = i32::try_from(year).ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}
