//! Human-friendly durations (`500ms`, `2s`, `1m30s`, `1d`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Parse a duration string. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return secs_to_duration(secs);
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// Render an elapsed time for people, to the millisecond.
pub fn format_elapsed(d: Duration) -> String {
    let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    format_duration(Duration::from_millis(millis))
}

fn secs_to_duration(secs: f64) -> Result<Duration, String> {
    if secs < 0.0 || !secs.is_finite() {
        return Err(format!("invalid duration {secs}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Text(String),
    Secs(f64),
}

fn from_raw(raw: Raw) -> Result<Duration, String> {
    match raw {
        Raw::Text(s) => parse_duration(&s),
        Raw::Secs(n) => secs_to_duration(n),
    }
}

/// Serialize a duration as fractional milliseconds.
pub fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// `#[serde(with = "...")]` helpers for `Option<Duration>`.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(d)?;
        raw.map(from_raw).transpose().map_err(serde::de::Error::custom)
    }
}
