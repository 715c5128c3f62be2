//! Captured property values
//!
//! `FieldValue` is the runtime value a change source reports for a property.
//! It serializes as the plain JSON value it holds, so the JSON projection of a
//! record is a flat string-keyed object.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Final property map of one audit record (recorded name → value)
pub type TrackedProperties = BTreeMap<String, FieldValue>;

/// A property value as reported by the change source
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl FieldValue {
    /// Runtime type name, used in type mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Uuid(_) => "uuid",
            FieldValue::Json(_) => "json",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Opaque string form of a primary key value
    ///
    /// Any non-null value is accepted; numeric keys are never narrowed.
    pub fn as_key(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Bytes(b) => Some(BASE64.encode(b)),
            FieldValue::Timestamp(t) => Some(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            FieldValue::Uuid(u) => Some(u.to_string()),
            FieldValue::Json(v) => Some(v.to_string()),
        }
    }

    /// Convert into a plain JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Json(v) => v.clone(),
            other => other
                .as_key()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Int(i) => serializer.serialize_i64(*i),
            FieldValue::Float(f) => serializer.serialize_f64(*f),
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Bytes(b) => serializer.serialize_str(&BASE64.encode(b)),
            FieldValue::Timestamp(t) => {
                serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            FieldValue::Uuid(u) => u.serialize(serializer),
            FieldValue::Json(v) => v.serialize(serializer),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for FieldValue {
    fn from(v: Bytes) -> Self {
        FieldValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(v: serde_json::Value) -> Self {
        FieldValue::Json(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Typed view of a `FieldValue`, used by value-changing rules
///
/// Returns `None` when the stored value cannot be cast to `Self`.
pub trait FromFieldValue: Sized {
    fn from_field_value(value: &FieldValue) -> Option<Self>;
}

impl FromFieldValue for bool {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromFieldValue for i64 {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromFieldValue for f64 {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromFieldValue for String {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromFieldValue for Bytes {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromFieldValue for DateTime<Utc> {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl FromFieldValue for Uuid {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl FromFieldValue for serde_json::Value {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        Some(value.to_json())
    }
}

/// A (name, value) pair flowing through a property rule chain
#[derive(Debug, Clone, PartialEq)]
pub struct NameValue {
    pub name: String,
    pub value: FieldValue,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}
