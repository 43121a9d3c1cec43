//! Serde helpers for `Duration` fields.
//!
//! Durations are written as (possibly fractional) seconds, matching the YAML
//! configuration format: `timeout: 1.5` means one and a half seconds.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs_f64().serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    from_secs(secs).map_err(serde::de::Error::custom)
}

/// Seconds to `Duration`. Finite values past the range saturate at `Duration::MAX`.
fn from_secs(secs: f64) -> Result<Duration, std::time::TryFromFloatSecsError> {
    Duration::try_from_secs_f64(secs).or_else(|e| {
        if secs.is_finite() && secs > 0.0 {
            Ok(Duration::MAX)
        } else {
            Err(e)
        }
    })
}

/// Same encoding for `Option<Duration>`.
pub mod option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => super::from_secs(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
