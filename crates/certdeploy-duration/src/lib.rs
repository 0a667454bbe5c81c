//! Duration (de)serialization shared by config and retry types.
//!
//! Durations in certdeploy configuration are seconds-denominated integers
//! on the wire (YAML/env/CLI) but `std::time::Duration` everywhere else.
//! These helpers let `#[serde(with = "...")]` fields accept either a plain
//! integer (seconds) or a humantime string (`"30s"`, `"5m"`), and always
//! serialize back out as an integer number of seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either an integer (seconds) or a
/// humantime string.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        Seconds(u64),
        Human(String),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::Seconds(secs) => Ok(Duration::from_secs(secs)),
        DurationHelper::Human(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
    }
}

/// Serialize a `Duration` as a whole number of seconds.
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

/// Same as [`deserialize_duration`] but for an `Option<Duration>` field,
/// where the config key may be entirely absent or explicitly `null`.
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OptDurationHelper {
        Seconds(u64),
        Human(String),
    }

    let helper = Option::<OptDurationHelper>::deserialize(deserializer)?;
    match helper {
        None => Ok(None),
        Some(OptDurationHelper::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(OptDurationHelper::Human(s)) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
    }
}

pub fn serialize_opt_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&d.as_secs()),
        None => serializer.serialize_none(),
    }
}

/// Format a `Duration` for log/error messages (`"30s"`, `"5m"`, ...).
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

/// A wall-clock time-of-day (`HH:MM`), used for `renew_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl WallClockTime {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid wall-clock time {s:?}, expected HH:MM"))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| format!("invalid hour in {s:?}"))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| format!("invalid minute in {s:?}"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("wall-clock time {s:?} out of range"));
        }
        Ok(Self { hour, minute })
    }
}

impl std::fmt::Display for WallClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for WallClockTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WallClockTime> for String {
    fn from(value: WallClockTime) -> Self {
        value.to_string()
    }
}
