//! Value coercion shared by the transformer and the verification engine.
//!
//! Both sides must derive the same expected value from a source column, so the
//! rules live here and nowhere else.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Epoch values at or above this magnitude are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

/// Coerce a loosely typed flag.
///
/// Returns the offending value rendered as text when it is not in the truth
/// table. Absent and null values are `false`.
pub fn coerce_bool(value: Option<&Value>) -> Result<bool, String> {
    let value = match value {
        None | Some(Value::Null) => return Ok(false),
        Some(v) => v,
    };
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(n.to_string()),
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "on" => Ok(true),
            "false" | "f" | "no" | "n" | "0" | "off" | "" => Ok(false),
            _ => Err(format!("\"{}\"", s)),
        },
        other => Err(other.to_string()),
    }
}

/// Parse a source timestamp; `None` when absent or not in a recognised format.
pub fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(from_epoch);
    }
    None
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Target timestamp representation: RFC 3339, UTC, millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Trimmed text, empty when absent.
pub fn clean_text(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

/// Natural-key normalization: trimmed and lowercased.
pub fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Trimmed text, `None` when absent or blank.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
