//! Recurrence patterns and next occurrence calculation.
//!
//! Supports the shortcuts `hourly`, `daily` and `weekly`, and fixed
//! intervals written as `every_<n>_minutes`, `every_<n>_hours` or
//! `every_<n>_days`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::clock::add_saturating;

/// Errors that can occur when parsing a recurrence pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Not one of the known shortcuts or interval forms.
    #[error("unknown recurrence pattern: {0}")]
    UnknownPattern(String),

    /// Interval form with a missing, zero, or out-of-range count.
    #[error("invalid interval count in recurrence pattern: {0}")]
    InvalidCount(String),
}

/// Unit of an `every_<n>_<unit>` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        }
    }

    fn seconds(&self) -> u64 {
        match self {
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 60 * 60,
            IntervalUnit::Days => 24 * 60 * 60,
        }
    }
}

/// How often a recurring task runs again after it finishes.
///
/// Persisted as its pattern string (`"daily"`, `"every_15_minutes"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recurrence {
    Hourly,
    Daily,
    Weekly,
    /// Every `count` units.
    Every { count: u32, unit: IntervalUnit },
}

impl Recurrence {
    /// Fixed interval with a non-zero count.
    pub fn every(count: u32, unit: IntervalUnit) -> Result<Self, ScheduleError> {
        if count == 0 {
            return Err(ScheduleError::InvalidCount(format!(
                "every_0_{}",
                unit.as_str()
            )));
        }
        Ok(Recurrence::Every { count, unit })
    }

    /// Time between two occurrences.
    pub fn interval(&self) -> Duration {
        match self {
            Recurrence::Hourly => Duration::from_secs(60 * 60),
            Recurrence::Daily => Duration::from_secs(24 * 60 * 60),
            Recurrence::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
            Recurrence::Every { count, unit } => {
                Duration::from_secs(unit.seconds().saturating_mul(u64::from(*count)))
            }
        }
    }

    /// The first occurrence strictly after `at`.
    pub fn next_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        add_saturating(at, self.interval())
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Hourly => f.write_str("hourly"),
            Recurrence::Daily => f.write_str("daily"),
            Recurrence::Weekly => f.write_str("weekly"),
            Recurrence::Every { count, unit } => write!(f, "every_{}_{}", count, unit.as_str()),
        }
    }
}

impl FromStr for Recurrence {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = s.trim().to_ascii_lowercase();
        match pattern.as_str() {
            "hourly" => return Ok(Recurrence::Hourly),
            "daily" => return Ok(Recurrence::Daily),
            "weekly" => return Ok(Recurrence::Weekly),
            _ => {}
        }

        let parts: Vec<&str> = pattern.split('_').collect();
        let [prefix, count, unit] = parts.as_slice() else {
            return Err(ScheduleError::UnknownPattern(s.to_string()));
        };
        if *prefix != "every" {
            return Err(ScheduleError::UnknownPattern(s.to_string()));
        }
        let unit = match *unit {
            "minutes" => IntervalUnit::Minutes,
            "hours" => IntervalUnit::Hours,
            "days" => IntervalUnit::Days,
            _ => return Err(ScheduleError::UnknownPattern(s.to_string())),
        };
        let count: u32 = count
            .parse()
            .map_err(|_| ScheduleError::InvalidCount(s.to_string()))?;
        Recurrence::every(count, unit)
    }
}

impl TryFrom<String> for Recurrence {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Recurrence> for String {
    fn from(recurrence: Recurrence) -> Self {
        recurrence.to_string()
    }
}
