// # Custom Scalars
//
// Scalar types beyond the GraphQL builtins, plus the input-side parsing and
// validation they rely on. Temporal inputs accept three forms, tried in
// order: `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.fff]`, and ISO-8601 with a
// UTC offset.

use async_graphql::dynamic::Scalar;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{GatewayError, Result};

/// A parsed temporal input, before coercion to the target column type.
#[derive(Debug, Clone, PartialEq)]
pub enum TemporalValue {
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl TemporalValue {
    pub fn as_date(&self) -> NaiveDate {
        match self {
            TemporalValue::Date(d) => *d,
            TemporalValue::Timestamp(ts) => ts.date(),
            TemporalValue::TimestampTz(ts) => ts.naive_utc().date(),
        }
    }

    pub fn as_timestamp(&self) -> NaiveDateTime {
        match self {
            TemporalValue::Date(d) => d.and_time(NaiveTime::MIN),
            TemporalValue::Timestamp(ts) => *ts,
            TemporalValue::TimestampTz(ts) => ts.naive_utc(),
        }
    }

    /// Naive inputs are interpreted as UTC.
    pub fn as_timestamptz(&self) -> DateTime<Utc> {
        match self {
            TemporalValue::Date(d) => d.and_time(NaiveTime::MIN).and_utc(),
            TemporalValue::Timestamp(ts) => ts.and_utc(),
            TemporalValue::TimestampTz(ts) => *ts,
        }
    }
}

/// Parse a temporal input string, trying the documented forms in order.
pub fn parse_temporal(raw: &str) -> Result<TemporalValue> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(TemporalValue::Date(date));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(TemporalValue::Timestamp(ts));
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(TemporalValue::TimestampTz(ts.with_timezone(&Utc)));
    }
    Err(GatewayError::Validation(format!(
        "invalid datetime value {:?}: expected YYYY-MM-DD, YYYY-MM-DD HH:MM:SS[.fff] or ISO-8601 with offset",
        raw
    )))
}

/// Validate a UUID-typed input value.
pub fn parse_uuid(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|_| GatewayError::Validation(format!("invalid UUID value {:?}", raw)))
}

/// Validate a network-typed (inet/cidr/macaddr) input value. Accepts an IP
/// address with optional prefix length, or a colon/dash separated MAC.
pub fn validate_network(raw: &str) -> Result<()> {
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (raw, None),
    };
    if let Some(prefix) = prefix {
        if prefix.parse::<u8>().is_err() {
            return Err(GatewayError::Validation(format!(
                "invalid network prefix in {:?}",
                raw
            )));
        }
    }
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    let is_mac = {
        let parts: Vec<&str> = addr.split([':', '-']).collect();
        (parts.len() == 6 || parts.len() == 8)
            && parts
                .iter()
                .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    };
    if is_mac && prefix.is_none() {
        return Ok(());
    }
    Err(GatewayError::Validation(format!(
        "invalid network address {:?}",
        raw
    )))
}

/// Validate a bit-string input value: only `0` and `1`.
pub fn validate_bit_string(raw: &str) -> Result<()> {
    if !raw.is_empty() && raw.chars().all(|c| c == '0' || c == '1') {
        return Ok(());
    }
    Err(GatewayError::Validation(format!(
        "invalid bit string {:?}: only 0 and 1 are allowed",
        raw
    )))
}

/// Coerce a JSON scalar input. Objects, arrays and scalars pass through
/// structurally; a string is accepted as JSON text and parsed.
pub fn coerce_json_input(value: serde_json::Value) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::String(text) => serde_json::from_str(&text).map_err(|e| {
            GatewayError::Validation(format!("string is not valid JSON text: {}", e))
        }),
        other => Ok(other),
    }
}

/// The custom scalar types registered into every generated schema.
pub fn custom_scalars() -> Vec<Scalar> {
    vec![
        Scalar::new("BigInt").description(
            "64-bit integer, transported as a number or numeric string to avoid precision loss.",
        ),
        Scalar::new("Decimal").description(
            "Arbitrary-precision decimal, transported as its exact text representation.",
        ),
        Scalar::new("DateTime").description(
            "Temporal value. Inputs accept YYYY-MM-DD, YYYY-MM-DD HH:MM:SS[.fff], \
             or ISO-8601 with offset; outputs are ISO-8601.",
        ),
        Scalar::new("JSON").description(
            "Arbitrary JSON value. Objects, arrays and scalars keep their structure; \
             a string input is parsed as JSON text. Binary (bytea) data appears as \
             base16 text with a \\x prefix.",
        ),
    ]
}
