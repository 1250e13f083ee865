//! Typed property and parameter values.
//!
//! The management service hands back untyped variants. `Value` keeps the
//! variant tag and exposes failable accessors, so a property of the wrong
//! type becomes a [`WmiError::TypeMismatch`] instead of a panic.

use crate::error::{Result, WmiError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A property value or method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Property present but unset
    Null,
    Bool(bool),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    String(String),
    StringArray(Vec<String>),
    UInt16Array(Vec<u16>),
}

impl Value {
    /// Name of the held variant, used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "sint32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "sint64",
            Value::UInt64(_) => "uint64",
            Value::String(_) => "string",
            Value::StringArray(_) => "string[]",
            Value::UInt16Array(_) => "uint16[]",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn mismatch(&self, expected: &'static str) -> WmiError {
        WmiError::TypeMismatch {
            expected,
            actual: self.type_name(),
        }
    }

    fn integer(&self) -> Option<i128> {
        match *self {
            Value::UInt16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => Some(v.into()),
            Value::UInt64(v) => Some(v.into()),
            _ => None,
        }
    }

    fn integer_as<T: TryFrom<i128>>(&self, expected: &'static str) -> Result<T> {
        self.integer()
            .and_then(|v| T::try_from(v).ok())
            .ok_or_else(|| self.mismatch(expected))
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("boolean")),
        }
    }

    /// Any integer variant whose value fits in `u16`.
    pub fn as_u16(&self) -> Result<u16> {
        self.integer_as("uint16")
    }

    /// Any integer variant whose value fits in `i32`.
    pub fn as_i32(&self) -> Result<i32> {
        self.integer_as("sint32")
    }

    /// Any integer variant whose value fits in `u32`.
    pub fn as_u32(&self) -> Result<u32> {
        self.integer_as("uint32")
    }

    /// Any integer variant whose value fits in `u64`.
    pub fn as_u64(&self) -> Result<u64> {
        self.integer_as("uint64")
    }

    pub fn as_string_array(&self) -> Result<&[String]> {
        match self {
            Value::StringArray(v) => Ok(v),
            other => Err(other.mismatch("string[]")),
        }
    }

    pub fn as_u16_array(&self) -> Result<&[u16]> {
        match self {
            Value::UInt16Array(v) => Ok(v),
            other => Err(other.mismatch("uint16[]")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::StringArray(v) => write!(f, "{v:?}"),
            Value::UInt16Array(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

impl From<Vec<u16>> for Value {
    fn from(v: Vec<u16>) -> Self {
        Value::UInt16Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_accessor() {
        let v = Value::from("vm-1");
        assert_eq!(v.as_str().unwrap(), "vm-1");
        assert!(matches!(
            v.as_u32(),
            Err(WmiError::TypeMismatch {
                expected: "uint32",
                actual: "string"
            })
        ));
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(Value::UInt16(7).as_u32().unwrap(), 7);
        assert_eq!(Value::UInt32(4096).as_i32().unwrap(), 4096);
        assert_eq!(Value::Int64(1024).as_u64().unwrap(), 1024);
    }

    #[test]
    fn test_integer_out_of_range_is_mismatch() {
        assert!(Value::Int32(-1).as_u32().is_err());
        assert!(Value::UInt64(u64::MAX).as_i32().is_err());
        assert!(Value::UInt32(70_000).as_u16().is_err());
    }

    #[test]
    fn test_null_is_not_a_string() {
        assert!(Value::Null.is_null());
        assert!(Value::Null.as_str().is_err());
    }

    #[test]
    fn test_arrays() {
        let notes = Value::from(vec!["a\nb".to_string()]);
        assert_eq!(notes.as_string_array().unwrap(), ["a\nb".to_string()]);
        assert_eq!(
            Value::from(vec![2u16, 1]).as_u16_array().unwrap(),
            [2u16, 1]
        );
        assert!(Value::Bool(true).as_string_array().is_err());
    }
}
