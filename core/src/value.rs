//! Dynamic values bound to statements and read back from rows.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{QuarryError, Result};
use crate::model::Model;
use crate::row::Row;

/// A single database value.
///
/// `List` binds as a PostgreSQL array (or JSON when the target column is
/// JSON); `Object` carries a nested record produced by joins and prefetches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    /// `timestamp without time zone`
    Timestamp(NaiveDateTime),
    /// `timestamp with time zone`
    TimestampTz(DateTime<FixedOffset>),
    Date(NaiveDate),
    Uuid(Uuid),
    List(Vec<Value>),
    Object(Row),
}

/// Hashable projection of a [`Value`], used to correlate prefetched rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Date(NaiveDate),
    Micros(i64),
}

impl Value {
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Json(_) => "json",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Date(_) => "date",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text rendering used for LIKE patterns.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(v) => v.clone(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Timestamp(v) => v.to_string(),
            Value::TimestampTz(v) => v.to_rfc3339(),
            Value::Date(v) => v.to_string(),
            Value::Uuid(v) => v.to_string(),
            Value::Json(_) | Value::List(_) | Value::Object(_) => self.to_json().to_string(),
        }
    }

    /// Converts to a JSON document.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Hash key for in-memory joins; `None` for null, floats and composites.
    pub fn key(&self) -> Option<ValueKey> {
        match self {
            Value::Bool(v) => Some(ValueKey::Bool(*v)),
            Value::Int(v) => Some(ValueKey::Int(*v)),
            Value::Text(v) => Some(ValueKey::Text(v.clone())),
            Value::Uuid(v) => Some(ValueKey::Uuid(*v)),
            Value::Date(v) => Some(ValueKey::Date(*v)),
            Value::Timestamp(v) => Some(ValueKey::Micros(v.and_utc().timestamp_micros())),
            Value::TimestampTz(v) => Some(ValueKey::Micros(v.timestamp_micros())),
            Value::Null | Value::Float(_) | Value::Json(_) | Value::List(_) | Value::Object(_) => {
                None
            }
        }
    }
}

// ==================== From implementations ====================

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                #[inline]
                fn from(value: $ty) -> Self {
                    Value::$variant(value $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    u32 => Int as i64,
    f32 => Float as f64,
    f64 => Float,
    String => Text,
    serde_json::Value => Json,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    NaiveDate => Date,
    Uuid => Uuid,
    Row => Object,
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    #[inline]
    fn from(value: DateTime<Utc>) -> Self {
        Value::TimestampTz(value.fixed_offset())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    #[inline]
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    #[inline]
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

// ==================== FromValue ====================

/// Conversion from a [`Value`] into a concrete Rust type.
pub trait FromValue: Sized {
    /// # Errors
    ///
    /// Returns [`QuarryError::Decode`] when the value has an incompatible shape.
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: &str, value: &Value) -> Result<T> {
    Err(QuarryError::Decode(format!(
        "expected {expected}, found {}",
        value.type_name()
    )))
}

impl FromValue for Value {
    #[inline]
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            other => mismatch("bool", &other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(v),
            other => mismatch("int", &other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| QuarryError::Decode(format!("{wide} overflows i32")))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            other => mismatch("float", &other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v),
            other => mismatch("text", &other),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v),
            Value::Text(raw) => serde_json::from_str(&raw)
                .map_err(|e| QuarryError::Decode(format!("invalid json: {e}"))),
            other => Ok(other.to_json()),
        }
    }
}

impl FromValue for DateTime<FixedOffset> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::TimestampTz(v) => Ok(v),
            Value::Timestamp(v) => Ok(v.and_utc().fixed_offset()),
            other => mismatch("timestamptz", &other),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self> {
        DateTime::<FixedOffset>::from_value(value).map(|v| v.with_timezone(&Utc))
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Timestamp(v) => Ok(v),
            Value::TimestampTz(v) => Ok(v.naive_utc()),
            other => mismatch("timestamp", &other),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Date(v) => Ok(v),
            other => mismatch("date", &other),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Uuid(v) => Ok(v),
            Value::Text(raw) => {
                Uuid::parse_str(&raw).map_err(|e| QuarryError::Decode(format!("invalid uuid: {e}")))
            }
            other => mismatch("uuid", &other),
        }
    }
}

impl FromValue for Row {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(row) => Ok(row),
            other => mismatch("object", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("list", &other),
        }
    }
}

/// Decodes a nested record into a typed model.
pub fn decode_model<M: Model>(value: Value) -> Result<Option<M>> {
    match value {
        Value::Null => Ok(None),
        Value::Object(row) => M::from_row(row).map(Some),
        other => mismatch("object", &other),
    }
}
