use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// A single extracted field value.
///
/// JSON input is coerced once at ingestion; everything downstream works on
/// this closed set of variants.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    /// Arrays and empty objects, passed through untouched.
    Json(Value),
}

impl FieldValue {
    /// Coerces an untyped JSON value.
    ///
    /// Strings holding an ISO date become dates. Everything else keeps its
    /// exact JSON form: integers stay integers, timestamps stay text (with a
    /// date view), arrays and objects pass through.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(flag) => FieldValue::Bool(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => FieldValue::Integer(integer),
                None => number
                    .as_f64()
                    .map(FieldValue::Number)
                    .unwrap_or_else(|| FieldValue::Text(number.to_string())),
            },
            Value::String(text) => Self::coerce_text(text),
            Value::Array(_) | Value::Object(_) => FieldValue::Json(value.clone()),
        }
    }

    fn coerce_text(text: &str) -> Self {
        match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            Ok(date) => FieldValue::Date(date),
            Err(_) => FieldValue::Text(text.to_string()),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldValue::Integer(_) | FieldValue::Number(_))
    }

    /// Dates and RFC 3339 timestamps.
    pub fn is_date(&self) -> bool {
        match self {
            FieldValue::Date(_) => true,
            FieldValue::Text(text) => DateTime::parse_from_rfc3339(text.trim()).is_ok(),
            _ => false,
        }
    }

    /// Null or the empty string.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(text) => text.is_empty(),
            _ => false,
        }
    }

    /// Canonical string form. Null renders as `"null"`.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Null => Cow::Borrowed("null"),
            FieldValue::Text(text) => Cow::Borrowed(text.as_str()),
            FieldValue::Integer(integer) => Cow::Owned(integer.to_string()),
            FieldValue::Number(number) => Cow::Owned(format_number(*number)),
            FieldValue::Bool(flag) => Cow::Borrowed(if *flag { "true" } else { "false" }),
            FieldValue::Date(date) => Cow::Owned(date.format("%Y-%m-%d").to_string()),
            FieldValue::Json(value) => Cow::Owned(value.to_string()),
        }
    }

    /// Numeric view; text is parsed after trimming.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(integer) => Some(*integer as f64),
            FieldValue::Number(number) => Some(*number),
            FieldValue::Text(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|number| number.is_finite()),
            _ => None,
        }
    }

    /// Date view; text is parsed as `YYYY-MM-DD`, `DD/MM/YYYY` or an
    /// RFC 3339 timestamp (keeping its local calendar day).
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(date) => Some(*date),
            FieldValue::Text(text) => {
                let text = text.trim();
                DATE_FORMATS
                    .iter()
                    .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                    .or_else(|| {
                        DateTime::parse_from_rfc3339(text)
                            .ok()
                            .map(|timestamp| timestamp.date_naive())
                    })
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Integer(integer) => Value::Number(Number::from(*integer)),
            FieldValue::Number(number) => Number::from_f64(*number)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Bool(flag) => Value::Bool(*flag),
            FieldValue::Date(date) => Value::String(date.format("%Y-%m-%d").to_string()),
            FieldValue::Json(value) => value.clone(),
        }
    }
}

fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        format!("{}", number)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(FieldValue::from_json(&raw))
    }
}
