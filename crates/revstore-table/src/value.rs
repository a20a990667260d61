use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use revstore_types::Tid;

use crate::schema::AttributeType;

/// A single attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
    Tid(Tid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// A row: attribute name to value.
pub type Row = BTreeMap<String, Value>;

impl Value {
    /// The attribute type this value satisfies, or `None` for `Null`.
    pub fn attribute_type(&self) -> Option<AttributeType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(AttributeType::Int),
            Value::Text(_) => Some(AttributeType::Text),
            Value::Blob(_) => Some(AttributeType::Blob),
            Value::Tid(_) => Some(AttributeType::Tid),
            Value::Timestamp(_) => Some(AttributeType::Timestamp),
            Value::Json(_) => Some(AttributeType::Json),
        }
    }

    /// Order two values of the same type. JSON and mixed types are unordered.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            (Value::Tid(a), Value::Tid(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The render id, if this is one.
    pub fn as_tid(&self) -> Option<&Tid> {
        match self {
            Value::Tid(v) => Some(v),
            _ => None,
        }
    }

    /// The timestamp, if this is one.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// The JSON document, if this is one.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Tid> for Value {
    fn from(v: Tid) -> Self {
        Value::Tid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn same_type_values_compare() {
        assert_eq!(Value::Int(1).compare(&Value::Int(2)), Some(Ordering::Less));
        assert_eq!(
            Value::from("b").compare(&Value::from("a")),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn tids_compare_by_time() {
        let early = Tid::at(Utc.timestamp_millis_opt(10).unwrap());
        let late = Tid::at(Utc.timestamp_millis_opt(20).unwrap());
        assert_eq!(
            Value::from(early).compare(&Value::from(late)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn mixed_and_json_values_are_unordered() {
        assert_eq!(Value::Int(1).compare(&Value::from("1")), None);
        let j = Value::from(serde_json::json!({}));
        assert_eq!(j.compare(&j), None);
    }

    #[test]
    fn attribute_types() {
        assert_eq!(Value::Int(0).attribute_type(), Some(AttributeType::Int));
        assert_eq!(Value::Null.attribute_type(), None);
    }
}
