//! Scalar values stored in records and used as filter operands.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::schema::AttributeType;

/// Format used to render timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// Arbitrary-precision decimal value.
    Decimal(Decimal),
    /// Text value.
    Text(String),
    /// Timestamp without time zone.
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Returns whether this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Coerces a JSON operand to the given attribute type.
    ///
    /// Returns a human-readable message when the operand does not fit.
    pub fn from_json(json: &serde_json::Value, ty: AttributeType) -> Result<Self, String> {
        use serde_json::Value as Json;

        if json.is_null() {
            return Ok(Self::Null);
        }

        match (ty, json) {
            (AttributeType::Integer, Json::Number(n)) => n
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| format!("{n} is not an integer")),
            (AttributeType::Integer, Json::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Self::Int)
                .map_err(|_| format!("'{s}' is not an integer")),
            (AttributeType::Float, Json::Number(n)) => n
                .as_f64()
                .map(Self::Float)
                .ok_or_else(|| format!("{n} is not a number")),
            (AttributeType::Float, Json::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Self::Float)
                .map_err(|_| format!("'{s}' is not a number")),
            (AttributeType::Decimal, Json::Number(n)) => n
                .to_string()
                .parse::<Decimal>()
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .map(Self::Decimal)
                .map_err(|_| format!("{n} is not a decimal")),
            (AttributeType::Decimal, Json::String(s)) => s
                .trim()
                .parse::<Decimal>()
                .map(Self::Decimal)
                .map_err(|_| format!("'{s}' is not a decimal")),
            (AttributeType::Text, Json::String(s)) => Ok(Self::Text(s.clone())),
            (AttributeType::Text, Json::Number(n)) => Ok(Self::Text(n.to_string())),
            (AttributeType::Text, Json::Bool(b)) => Ok(Self::Text(b.to_string())),
            (AttributeType::Boolean, Json::Bool(b)) => Ok(Self::Bool(*b)),
            (AttributeType::Boolean, Json::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Self::Bool(false)),
                Some(1) => Ok(Self::Bool(true)),
                _ => Err(format!("{n} is not a boolean")),
            },
            (AttributeType::Timestamp, Json::String(s)) => parse_timestamp(s)
                .map(Self::Timestamp)
                .ok_or_else(|| format!("'{s}' is not a timestamp")),
            (ty, other) => Err(format!("{other} cannot be used as {}", ty.as_str())),
        }
    }

    /// Converts this value to its JSON form.
    ///
    /// Timestamps become `YYYY-MM-DD HH:MM:SS` strings and decimals become
    /// floating point numbers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(n) => Json::from(*n),
            Self::Float(f) => float_to_json(*f),
            Self::Decimal(d) => d.to_f64().map_or(Json::Null, float_to_json),
            Self::Text(s) => Json::String(s.clone()),
            Self::Timestamp(ts) => Json::String(ts.format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    /// Compares two non-null values.
    ///
    /// Numbers compare across integer, float and decimal. Returns `None`
    /// when either side is NULL or the types are unrelated.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Decimal(a), Self::Decimal(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    /// Orders values for sorting, with NULL before everything else.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    /// Matches this value against a SQL `LIKE` pattern.
    ///
    /// `%` matches any run of characters and `_` one character; matching
    /// ignores ASCII case. Only text values match.
    pub fn matches_like(&self, pattern: &str) -> bool {
        let Self::Text(text) = self else {
            return false;
        };
        match like_regex(pattern) {
            Ok(regex) => regex.is_match(&text.to_ascii_lowercase()),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Unusable LIKE pattern");
                false
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }
}

fn float_to_json(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Translates a `LIKE` pattern into an anchored regex over ASCII-lowercased text.
pub fn like_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut regex_str = String::from("(?s)^");
    for c in pattern.to_ascii_lowercase().chars() {
        match c {
            '%' => regex_str.push_str(".*"),
            '_' => regex_str.push('.'),
            c => regex_str.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str)
}

/// Parses the timestamp formats accepted in filters and payloads.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
