// SPDX-License-Identifier: Apache-2.0

//! DuckDB value conversion
//!
//! Results leave the engine as JSON. Integers are only emitted as JSON numbers
//! while they fit the IEEE-754 safe-integer range; anything wider is carried
//! as its exact decimal string so no consumer silently loses precision.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value as DuckValue};
use serde_json::{Number, Value as JsonValue};

/// Largest integer exactly representable as an f64 (2^53 - 1).
pub const MAX_SAFE_INTEGER: i128 = 9_007_199_254_740_991;

/// Converts an integer, falling back to a string outside the safe range.
pub fn integer_to_json(value: i128) -> JsonValue {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&value) {
        JsonValue::Number(Number::from(value as i64))
    } else {
        JsonValue::String(value.to_string())
    }
}

fn float_to_json(value: f64) -> JsonValue {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(value.to_string()))
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Converts a DuckDB value into its JSON representation.
pub fn duckdb_to_json(value: DuckValue) -> JsonValue {
    match value {
        DuckValue::Null => JsonValue::Null,
        DuckValue::Boolean(b) => JsonValue::Bool(b),
        DuckValue::TinyInt(i) => integer_to_json(i as i128),
        DuckValue::SmallInt(i) => integer_to_json(i as i128),
        DuckValue::Int(i) => integer_to_json(i as i128),
        DuckValue::BigInt(i) => integer_to_json(i as i128),
        DuckValue::HugeInt(i) => integer_to_json(i),
        DuckValue::UTinyInt(i) => integer_to_json(i as i128),
        DuckValue::USmallInt(i) => integer_to_json(i as i128),
        DuckValue::UInt(i) => integer_to_json(i as i128),
        DuckValue::UBigInt(i) => integer_to_json(i as i128),
        DuckValue::Float(f) => float_to_json(f as f64),
        DuckValue::Double(f) => float_to_json(f),
        // Decimals keep their exact textual form
        DuckValue::Decimal(d) => JsonValue::String(d.to_string()),
        DuckValue::Text(s) => JsonValue::String(s),
        DuckValue::Enum(s) => JsonValue::String(s),
        DuckValue::Blob(b) => JsonValue::String(STANDARD.encode(b)),
        DuckValue::Timestamp(unit, v) => {
            let micros = to_micros(unit, v);
            match DateTime::from_timestamp_micros(micros) {
                Some(ts) => JsonValue::String(ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()),
                None => integer_to_json(micros as i128),
            }
        }
        DuckValue::Date32(days) => {
            let date = NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(Duration::days(days as i64)));
            match date {
                Some(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
                None => integer_to_json(days as i128),
            }
        }
        DuckValue::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            let secs = (micros / 1_000_000) as u32;
            let nanos = ((micros % 1_000_000) * 1_000) as u32;
            match NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos) {
                Some(t) => JsonValue::String(t.format("%H:%M:%S%.f").to_string()),
                None => integer_to_json(micros as i128),
            }
        }
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => JsonValue::String(format!("{months} months {days} days {nanos} ns")),
        DuckValue::List(items) | DuckValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(duckdb_to_json).collect())
        }
        other => JsonValue::String(format!("{other:?}")),
    }
}

/// Converts a JSON scalar into a DuckDB parameter value.
///
/// Used when importing rows fetched over HTTP; the target column type drives
/// the final cast inside DuckDB.
pub fn json_to_duckdb(value: &JsonValue) -> DuckValue {
    match value {
        JsonValue::Null => DuckValue::Null,
        JsonValue::Bool(b) => DuckValue::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                DuckValue::BigInt(i)
            } else if let Some(u) = n.as_u64() {
                DuckValue::UBigInt(u)
            } else {
                DuckValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}
