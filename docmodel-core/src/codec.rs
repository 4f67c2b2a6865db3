//! Conversion between records and JSON.
//!
//! Dates are written as ISO-8601 strings with millisecond precision
//! (`2024-05-01T12:00:00.000Z`). On the way back, any string that looks like an ISO-8601
//! timestamp is materialized into a `Bson::DateTime`, so dates survive a JSON round trip.

use bson::{Bson, DateTime};
use chrono::{NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;

use crate::{error::ModelResult, error::ModelError, Record};

static ISO_DATE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})$")
        .expect("static pattern is valid")
});

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static pattern is valid")
});

/// Formats a date the way it is persisted.
pub fn format_date(date: &DateTime) -> String {
    date.to_chrono()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Returns true for strings the persistence layer turns back into dates.
pub fn looks_like_iso_date(text: &str) -> bool {
    ISO_DATE_TIME.is_match(text)
}

/// Parses an ISO-8601 timestamp, or a plain `YYYY-MM-DD` date at midnight UTC.
pub fn parse_date(text: &str) -> Option<DateTime> {
    if looks_like_iso_date(text) {
        let normalized = match text.len() {
            // `YYYY-MM-DDTHH:MMZ` has no seconds; chrono requires them.
            17 => format!("{}:00Z", &text[..16]),
            _ => text.to_string(),
        };

        return chrono::DateTime::parse_from_rfc3339(&normalized)
            .ok()
            .map(|date| DateTime::from_chrono(date.with_timezone(&Utc)));
    }

    if ISO_DATE.is_match(text) {
        return NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|date| DateTime::from_chrono(date.and_utc()));
    }

    None
}

/// Converts a BSON value to JSON, rendering dates as ISO-8601 strings.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(flag) => Value::Bool(*flag),
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        Bson::Double(n) => Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(text) => Value::String(text.clone()),
        Bson::DateTime(date) => Value::String(format_date(date)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(record) => Value::Object(record_to_json(record)),
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        other => Value::String(other.to_string()),
    }
}

/// Converts a record to a JSON object.
pub fn record_to_json(record: &Record) -> Map<String, Value> {
    record
        .iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

/// Converts JSON to a BSON value, materializing ISO-8601 strings into dates.
///
/// Integers that fit in 32 bits become `Int32`, larger ones `Int64`; everything else numeric
/// becomes `Double`.
pub fn json_to_bson(value: Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(flag) => Bson::Boolean(flag),
        Value::Number(n) => match n.as_i64() {
            Some(int) => i32::try_from(int)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(int)),
            None => Bson::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => match looks_like_iso_date(&text)
            .then(|| parse_date(&text))
            .flatten()
        {
            Some(date) => Bson::DateTime(date),
            None => Bson::String(text),
        },
        Value::Array(items) => Bson::Array(items.into_iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(json_to_record(map)),
    }
}

/// Converts a JSON object to a record.
pub fn json_to_record(map: Map<String, Value>) -> Record {
    map.into_iter()
        .map(|(key, value)| (key, json_to_bson(value)))
        .collect()
}

/// Parses a JSON array of objects into records.
pub fn records_from_json(text: &str) -> ModelResult<Vec<Record>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(json_to_record(map)),
                other => Err(ModelError::Serialization(format!("expected an object, found {other}"))),
            })
            .collect(),
        other => Err(ModelError::Serialization(format!("expected an array of records, found {other}"))),
    }
}

/// Serializes records as a JSON array.
pub fn records_to_json(records: &[Record], pretty: bool) -> ModelResult<String> {
    let value = Value::Array(
        records
            .iter()
            .map(|record| Value::Object(record_to_json(record)))
            .collect(),
    );

    if pretty {
        Ok(serde_json::to_string_pretty(&value)?)
    } else {
        Ok(serde_json::to_string(&value)?)
    }
}
