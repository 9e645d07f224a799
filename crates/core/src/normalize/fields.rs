use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

/// Non-empty text at a JSON pointer. Numeric ids are rendered as text.
pub(crate) fn text_at(payload: &Value, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// First candidate pointer that yields text.
pub(crate) fn first_text(payload: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|pointer| text_at(payload, pointer))
}

pub(crate) fn is_object_at(payload: &Value, pointer: &str) -> bool {
    matches!(payload.pointer(pointer), Some(Value::Object(_)))
}

/// Timestamp text at a pointer; unparseable values count as absent.
pub(crate) fn timestamp_at(payload: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    match payload.pointer(pointer)? {
        Value::String(raw) => parse_timestamp(raw),
        _ => None,
    }
}

pub(crate) fn first_timestamp(payload: &Value, pointers: &[&str]) -> Option<DateTime<Utc>> {
    pointers.iter().find_map(|pointer| timestamp_at(payload, pointer))
}

/// Unix-seconds timestamp at a pointer.
pub(crate) fn unix_at(payload: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    let seconds = payload.pointer(pointer)?.as_i64()?;
    Utc.timestamp_opt(seconds, 0).single()
}

pub(crate) fn amount_at(payload: &Value, pointer: &str) -> Option<Decimal> {
    match payload.pointer(pointer)? {
        Value::Number(number) => parse_amount(&number.to_string()),
        Value::String(raw) => parse_amount(raw),
        _ => None,
    }
}

/// Integer amount in minor units (cents) at a pointer.
pub(crate) fn minor_units_at(payload: &Value, pointer: &str) -> Option<Decimal> {
    let cents = payload.pointer(pointer)?.as_i64()?;
    Some(Decimal::new(cents, 2))
}

/// Parses a provider timestamp.
///
/// Accepts RFC 3339, naive date-times (read as UTC) and bare dates (midnight
/// UTC). Anything else is `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
        .or_else(|| {
            // "129,90" style decimal comma
            if raw.contains('.') {
                None
            } else {
                Decimal::from_str(&raw.replace(',', ".")).ok()
            }
        })
}
