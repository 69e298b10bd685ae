//! MQTT payload codec.
//!
//! Decodes JSON-encoded Signal K style deltas into [`Reading`]s.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use thiserror::Error;

/// One decoded telemetry data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Measurement time, UTC, without zone.
    pub time: NaiveDateTime,
    /// Originating context (`context` in the payload).
    pub device_id: String,
    /// Measured quantity, e.g. `environment.outside.temperature`.
    pub path: String,
    /// `None` when the publisher sent `"value": null`.
    pub value: Option<f64>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON decode error: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Payload parsed but does not carry a usable reading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("unparseable timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Decode an MQTT payload into a [`Reading`].
pub fn decode(bytes: &[u8]) -> Result<Reading, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let time = required_str(&obj, "time")?;
    let time = parse_timestamp(time)?;
    let device_id = required_str(&obj, "context")?.to_owned();
    let path = required_str(&obj, "path")?.to_owned();

    let value = match obj.get("value") {
        None => return Err(SchemaError::MissingField("value").into()),
        Some(Value::Null) => None,
        Some(v) => Some(v.as_f64().ok_or(SchemaError::InvalidType {
            field: "value",
            expected: "a number or null",
        })?),
    };

    Ok(Reading {
        time,
        device_id,
        path,
        value,
    })
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, SchemaError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(SchemaError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(SchemaError::InvalidType {
            field,
            expected: "a string",
        }),
    }
}

/// Offset-carrying layouts, tried after strict RFC 3339. `%#z` accepts
/// `+02`, `+0200` and `+02:00`.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M%#z"];

/// Zone-less layouts, stored as given.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parse an ISO-8601 timestamp into a UTC `NaiveDateTime`.
///
/// Accepts what a PostgreSQL `TIMESTAMP` column would: a `T` or a space
/// between date and time, optional seconds and fraction, an optional `Z` or
/// numeric offset, or a bare date (midnight).
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, SchemaError> {
    let invalid = || SchemaError::InvalidTimestamp(s.to_owned());

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }

    let mut text = s.trim().to_owned();
    if text.as_bytes().get(10) == Some(&b' ') {
        text.replace_range(10..11, "T");
    }
    if let Some(stripped) = text.strip_suffix(['Z', 'z']) {
        text = format!("{stripped}+00:00");
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&text, fmt) {
            return Ok(dt.naive_utc());
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&text, fmt) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|_| invalid())?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(invalid)
}
