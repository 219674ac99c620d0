//! Field transforms applied between the source row image and the sink row
//!
//! Every transform is total: any input (including a missing field) yields a
//! value, falling back to the transform's default when the input cannot be
//! interpreted.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::str::FromStr;

/// Column name fragments that mark a field as holding a date
const DATE_LIKE_MARKERS: [&str; 5] = ["date", "created", "updated", "joined", "login"];

/// Named per-field transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    /// Currency text to decimal, e.g. `"1,299.00 ₹"` to `1299.00`; default 0
    Price,
    /// Integer count; default 0
    Count,
    /// Float rating; default 0.0
    Rating,
    /// ISO-8601 / SQL datetime / date to UTC; default NULL
    Timestamp,
    /// String; NULL becomes the empty string
    Text,
}

impl FieldTransform {
    pub fn apply(self, raw: Option<&Value>) -> SinkValue {
        match self {
            FieldTransform::Price => SinkValue::Decimal(clean_price(raw)),
            FieldTransform::Count => SinkValue::Int(parse_count(raw)),
            FieldTransform::Rating => SinkValue::Float(parse_rating(raw)),
            FieldTransform::Timestamp => coerce_timestamp(raw)
                .map(SinkValue::Timestamp)
                .unwrap_or(SinkValue::Null),
            FieldTransform::Text => SinkValue::String(to_text(raw)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldTransform::Price => "price",
            FieldTransform::Count => "count",
            FieldTransform::Rating => "rating",
            FieldTransform::Timestamp => "timestamp",
            FieldTransform::Text => "text",
        }
    }
}

/// One column value of a sink row
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(BigDecimal),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl SinkValue {
    /// Untransformed passthrough of a JSON value
    ///
    /// Nested arrays and objects are stored as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SinkValue::Null,
            Value::Bool(b) => SinkValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SinkValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    SinkValue::UInt(u)
                } else {
                    SinkValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => SinkValue::String(s.clone()),
            other => SinkValue::String(other.to_string()),
        }
    }
}

/// Values are bound into `INSERT ... VALUES (?, ...)` placeholders
///
/// Decimals and timestamps go over the wire as strings; the client sets
/// `date_time_input_format = best_effort` so ClickHouse parses both.
impl Serialize for SinkValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SinkValue::Null => serializer.serialize_none(),
            SinkValue::Bool(b) => serializer.serialize_u8(u8::from(*b)),
            SinkValue::Int(i) => serializer.serialize_i64(*i),
            SinkValue::UInt(u) => serializer.serialize_u64(*u),
            SinkValue::Float(f) => serializer.serialize_f64(*f),
            SinkValue::Decimal(d) => serializer.serialize_str(&d.to_string()),
            SinkValue::String(s) => serializer.serialize_str(s),
            SinkValue::Timestamp(ts) => {
                serializer.serialize_str(&ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            }
        }
    }
}

/// Whether a column name suggests it holds a date
pub fn is_date_like(field: &str) -> bool {
    let field = field.to_ascii_lowercase();
    DATE_LIKE_MARKERS.iter().any(|marker| field.contains(marker))
}

/// Keep digits and the decimal point, then parse
///
/// Leading points are dropped so abbreviations such as `Rs. 499` do not
/// turn into fractions.
pub fn clean_price(raw: Option<&Value>) -> BigDecimal {
    let text = match raw {
        Some(Value::String(s)) => s,
        // Numbers may be in exponent notation
        Some(Value::Number(n)) => {
            return BigDecimal::from_str(&n.to_string()).unwrap_or_else(|_| BigDecimal::zero())
        }
        _ => return BigDecimal::zero(),
    };

    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let digits = digits.trim_start_matches('.');
    if digits.is_empty() {
        return BigDecimal::zero();
    }

    BigDecimal::from_str(digits).unwrap_or_else(|_| BigDecimal::zero())
}

pub fn parse_count(raw: Option<&Value>) -> i64 {
    match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '-' || *c == '.')
                .collect();
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    cleaned
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .unwrap_or(0)
        }
        _ => 0,
    }
}

pub fn parse_rating(raw: Option<&Value>) -> f64 {
    let rating = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };

    rating.filter(|f| f.is_finite()).unwrap_or(0.0)
}

fn to_text(raw: Option<&Value>) -> String {
    match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Strings are parsed best-effort; integers are epoch time in seconds,
/// milliseconds or microseconds depending on magnitude
fn coerce_timestamp(raw: Option<&Value>) -> Option<DateTime<Utc>> {
    match raw? {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let value = n.as_i64()?;
            let magnitude = value.unsigned_abs();
            if magnitude >= 100_000_000_000_000 {
                DateTime::from_timestamp_micros(value)
            } else if magnitude >= 100_000_000_000 {
                DateTime::from_timestamp_millis(value)
            } else {
                DateTime::from_timestamp(value, 0)
            }
        }
        _ => None,
    }
}

/// Best-effort parse of the datetime formats seen in source rows, in UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}
