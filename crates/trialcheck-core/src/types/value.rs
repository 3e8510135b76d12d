//! Runtime value types for TrialCheck rules
//!
//! The `Value` enum represents every value a rule can observe in a record or
//! produce while being evaluated.

use super::catalog::FieldType;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime value type
///
/// Deserialization is untagged: a JSON string shaped like `YYYY-MM-DD`
/// becomes a [`Value::Date`], any other string a [`Value::String`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Number value (f64 for simplicity, handles both int and float)
    Number(f64),
    /// Calendar date
    Date(NaiveDate),
    /// String value
    String(String),
}

impl Value {
    /// Name of the value's runtime type, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "logical",
            Value::Number(_) => "numeric",
            Value::Date(_) => "date",
            Value::String(_) => "text",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// True for null and for strings that are empty after trimming
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Coerce a value to the declared type of the field it was read from.
    ///
    /// Form state frequently arrives as text, so numeric, date and logical
    /// fields accept their textual spellings. Returns `None` when the value
    /// cannot represent the declared type.
    pub fn coerce(&self, target: FieldType) -> Option<Value> {
        match (target, self) {
            (_, Value::Null) => Some(Value::Null),
            (FieldType::Numeric, Value::Number(_))
            | (FieldType::Date, Value::Date(_))
            | (FieldType::Logical, Value::Bool(_))
            | (FieldType::Text, Value::String(_)) => Some(self.clone()),
            (FieldType::Numeric, Value::String(s)) => {
                s.trim().parse::<f64>().ok().map(Value::Number)
            }
            (FieldType::Date, Value::String(s)) => {
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .ok()
                    .map(Value::Date)
            }
            (FieldType::Logical, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str()
            {
                "true" | "yes" | "y" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (FieldType::Text, other) => Some(Value::String(other.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}
