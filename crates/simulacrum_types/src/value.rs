//! Channel value kinds
//!
//! Every channel carries one value drawn from a small, closed set of kinds.
//! Values arriving from clients or device logic are coerced to the kind the
//! channel was declared with before they are stored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Value Type
// ─────────────────────────────────────────────────────────────────────────────

/// The declared type of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Bytes,
    Int,
    Float,
    Bool,
}

impl ValueType {
    /// The value a freshly materialized channel of this type starts with
    pub fn default_value(self) -> ChannelValue {
        match self {
            ValueType::String => ChannelValue::String(String::new()),
            ValueType::Bytes => ChannelValue::Bytes(Vec::new()),
            ValueType::Int => ChannelValue::Int(0),
            ValueType::Float => ChannelValue::Float(0.0),
            ValueType::Bool => ChannelValue::Bool(false),
        }
    }

    /// Canonical lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
        }
    }

    /// Parse a textual value (e.g. from a PV definition file) as this type
    pub fn parse_value(self, text: &str) -> Result<ChannelValue, ValueError> {
        ChannelValue::String(text.trim().to_string()).coerce(self)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(ValueType::String),
            "bytes" => Ok(ValueType::Bytes),
            "int" | "long" => Ok(ValueType::Int),
            "float" | "double" => Ok(ValueType::Float),
            "bool" => Ok(ValueType::Bool),
            _ => Err(ValueError::UnknownType(s.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Access Mode
// ─────────────────────────────────────────────────────────────────────────────

/// Whether clients may write a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        self == AccessMode::ReadWrite
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel Value
// ─────────────────────────────────────────────────────────────────────────────

/// A typed channel value
///
/// Serialized untagged so that clients can send plain JSON scalars; the
/// receiving channel coerces the value to its declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl ChannelValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ChannelValue::String(_) => ValueType::String,
            ChannelValue::Bytes(_) => ValueType::Bytes,
            ChannelValue::Int(_) => ValueType::Int,
            ChannelValue::Float(_) => ValueType::Float,
            ChannelValue::Bool(_) => ValueType::Bool,
        }
    }

    /// Get as f64 (also converts from int)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Float(f) => Some(*f),
            ChannelValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as i64 (also converts from float if lossless)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(i) => Some(*i),
            ChannelValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ChannelValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert this value to `target`, failing when no sensible conversion exists
    pub fn coerce(self, target: ValueType) -> Result<ChannelValue, ValueError> {
        if self.value_type() == target {
            return Ok(self);
        }

        let actual = self.value_type();
        let mismatch = || ValueError::Mismatch {
            expected: target,
            actual,
        };

        match (target, self) {
            (ValueType::Float, ChannelValue::Int(i)) => Ok(ChannelValue::Float(i as f64)),
            (ValueType::Float, ChannelValue::Bool(b)) => Ok(ChannelValue::Float(if b { 1.0 } else { 0.0 })),
            (ValueType::Float, ChannelValue::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(ChannelValue::Float)
                .map_err(|_| ValueError::Parse { expected: target, text: s }),

            (ValueType::Int, ChannelValue::Float(f)) if f.fract() == 0.0 => Ok(ChannelValue::Int(f as i64)),
            (ValueType::Int, ChannelValue::Bool(b)) => Ok(ChannelValue::Int(b as i64)),
            (ValueType::Int, ChannelValue::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(ChannelValue::Int)
                .map_err(|_| ValueError::Parse { expected: target, text: s }),

            (ValueType::Bool, ChannelValue::Int(i)) if i == 0 || i == 1 => Ok(ChannelValue::Bool(i == 1)),
            (ValueType::Bool, ChannelValue::Float(f)) if f == 0.0 || f == 1.0 => {
                Ok(ChannelValue::Bool(f == 1.0))
            }
            (ValueType::Bool, ChannelValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Ok(ChannelValue::Bool(true)),
                "false" | "off" | "0" => Ok(ChannelValue::Bool(false)),
                _ => Err(ValueError::Parse { expected: target, text: s }),
            },

            (ValueType::String, ChannelValue::Bytes(b)) => String::from_utf8(b)
                .map(ChannelValue::String)
                .map_err(|_| mismatch()),
            (ValueType::String, other) => Ok(ChannelValue::String(other.to_string())),

            (ValueType::Bytes, ChannelValue::String(s)) => Ok(ChannelValue::Bytes(s.into_bytes())),

            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::String(s) => f.write_str(s),
            ChannelValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ChannelValue::Int(i) => write!(f, "{}", i),
            ChannelValue::Float(v) => write!(f, "{}", v),
            ChannelValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// From Implementations
// ─────────────────────────────────────────────────────────────────────────────

impl From<bool> for ChannelValue {
    fn from(v: bool) -> Self {
        ChannelValue::Bool(v)
    }
}

impl From<i32> for ChannelValue {
    fn from(v: i32) -> Self {
        ChannelValue::Int(v as i64)
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        ChannelValue::Int(v)
    }
}

impl From<f32> for ChannelValue {
    fn from(v: f32) -> Self {
        ChannelValue::Float(v as f64)
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Float(v)
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        ChannelValue::String(v)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        ChannelValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for ChannelValue {
    fn from(v: Vec<u8>) -> Self {
        ChannelValue::Bytes(v)
    }
}

impl From<ChannelValue> for serde_json::Value {
    fn from(v: ChannelValue) -> Self {
        match v {
            ChannelValue::Bool(b) => serde_json::Value::Bool(b),
            ChannelValue::Int(i) => serde_json::Value::Number(i.into()),
            ChannelValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ChannelValue::String(s) => serde_json::Value::String(s),
            ChannelValue::Bytes(b) => {
                serde_json::Value::Array(b.into_iter().map(|x| serde_json::Value::from(x)).collect())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error when converting or parsing channel values
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("Unknown value type: {0}")]
    UnknownType(String),

    #[error("Expected {expected}, got {actual}")]
    Mismatch {
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Cannot parse {text:?} as {expected}")]
    Parse { expected: ValueType, text: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
