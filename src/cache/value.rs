//! Typed Serialization Codec
//!
//! Values carry a closed set of type tags. Drivers that only store strings
//! persist a `(type code, payload)` pair and rebuild the value on read.

use std::fmt;

use num_bigint::BigInt;
use serde_json::{Map, Value};

use crate::error::{CacheError, Result};

/// Largest integer a `f64` represents exactly (2^53).
const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_992;

// == Data Type ==
/// Storage discriminator for each value tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Undefined = 1,
    Null = 2,
    Object = 3,
    Boolean = 4,
    Number = 5,
    String = 6,
    Sequence = 7,
    BigInt = 8,
}

impl DataType {
    /// Numeric code written next to the payload.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Codes of the tags counters may operate on.
    pub const NUMERIC_CODES: [u8; 2] = [DataType::Number as u8, DataType::BigInt as u8];

    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Number | DataType::BigInt)
    }
}

impl TryFrom<i64> for DataType {
    type Error = CacheError;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            1 => Ok(DataType::Undefined),
            2 => Ok(DataType::Null),
            3 => Ok(DataType::Object),
            4 => Ok(DataType::Boolean),
            5 => Ok(DataType::Number),
            6 => Ok(DataType::String),
            7 => Ok(DataType::Sequence),
            8 => Ok(DataType::BigInt),
            other => Err(CacheError::Parse(format!("unknown data type code {}", other))),
        }
    }
}

// == Typed Value ==
/// A cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// Absence marker; never storable
    Undefined,
    Null,
    Object(Map<String, Value>),
    Boolean(bool),
    Number(f64),
    String(String),
    Sequence(Vec<Value>),
    BigInt(BigInt),
}

impl TypedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TypedValue::Undefined => DataType::Undefined,
            TypedValue::Null => DataType::Null,
            TypedValue::Object(_) => DataType::Object,
            TypedValue::Boolean(_) => DataType::Boolean,
            TypedValue::Number(_) => DataType::Number,
            TypedValue::String(_) => DataType::String,
            TypedValue::Sequence(_) => DataType::Sequence,
            TypedValue::BigInt(_) => DataType::BigInt,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.data_type().is_numeric()
    }

    // == Counter Arithmetic ==
    /// Adds `delta` to a numeric value, or `None` if the value is not numeric.
    ///
    /// Big integers stay exact; plain numbers use floating point.
    pub fn add_delta(&self, delta: i64) -> Option<TypedValue> {
        match self {
            TypedValue::Number(n) => Some(TypedValue::Number(n + delta as f64)),
            TypedValue::BigInt(n) => Some(TypedValue::BigInt(n + BigInt::from(delta))),
            _ => None,
        }
    }

    /// Initial value of a counter created from `delta`. Deltas outside the
    /// exact `f64` range become big integers.
    pub fn from_counter(delta: i64) -> TypedValue {
        if delta.unsigned_abs() > MAX_SAFE_INTEGER {
            TypedValue::BigInt(BigInt::from(delta))
        } else {
            TypedValue::Number(delta as f64)
        }
    }

    /// Converts to JSON. Big integers render as strings to stay exact.
    pub fn to_json(&self) -> Value {
        match self {
            TypedValue::Undefined | TypedValue::Null => Value::Null,
            TypedValue::Object(map) => Value::Object(map.clone()),
            TypedValue::Boolean(b) => Value::Bool(*b),
            TypedValue::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 => {
                Value::from(*n as i64)
            }
            TypedValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            TypedValue::String(s) => Value::String(s.clone()),
            TypedValue::Sequence(items) => Value::Array(items.clone()),
            TypedValue::BigInt(n) => Value::String(n.to_string()),
        }
    }
}

impl From<Value> for TypedValue {
    /// Integers beyond the exact `f64` range become big integers.
    fn from(value: Value) -> Self {
        match value {
            Value::Null => TypedValue::Null,
            Value::Bool(b) => TypedValue::Boolean(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TypedValue::from_counter(i)
                } else if let Some(u) = n.as_u64() {
                    TypedValue::BigInt(BigInt::from(u))
                } else {
                    TypedValue::Number(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => TypedValue::String(s),
            Value::Array(items) => TypedValue::Sequence(items),
            Value::Object(map) => TypedValue::Object(map),
        }
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::String(value.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        TypedValue::String(value)
    }
}

impl From<f64> for TypedValue {
    fn from(value: f64) -> Self {
        TypedValue::Number(value)
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::from_counter(value)
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Boolean(value)
    }
}

impl From<BigInt> for TypedValue {
    fn from(value: BigInt) -> Self {
        TypedValue::BigInt(value)
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Undefined => f.write_str("undefined"),
            TypedValue::String(s) => f.write_str(s),
            TypedValue::BigInt(n) => write!(f, "{}n", n),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// == Serialize ==
/// Encodes a value as a `(type, payload)` pair.
pub fn serialize(value: &TypedValue) -> Result<(DataType, String)> {
    let payload = match value {
        TypedValue::Undefined => {
            return Err(CacheError::Serialization(
                "undefined values cannot be stored".to_string(),
            ))
        }
        TypedValue::Null => "null".to_string(),
        TypedValue::Object(map) => serde_json::to_string(map)
            .map_err(|e| CacheError::Serialization(e.to_string()))?,
        TypedValue::Sequence(items) => serde_json::to_string(items)
            .map_err(|e| CacheError::Serialization(e.to_string()))?,
        TypedValue::Boolean(b) => b.to_string(),
        TypedValue::Number(n) => n.to_string(),
        TypedValue::String(s) => s.clone(),
        TypedValue::BigInt(n) => n.to_string(),
    };
    Ok((value.data_type(), payload))
}

// == Unserialize ==
/// Rebuilds a value from its payload and type code.
pub fn unserialize(payload: &str, code: i64) -> Result<TypedValue> {
    let value = match DataType::try_from(code)? {
        DataType::Undefined => TypedValue::Undefined,
        DataType::Null => TypedValue::Null,
        DataType::Object => TypedValue::Object(
            serde_json::from_str(payload).map_err(|e| CacheError::Parse(e.to_string()))?,
        ),
        DataType::Sequence => TypedValue::Sequence(
            serde_json::from_str(payload).map_err(|e| CacheError::Parse(e.to_string()))?,
        ),
        DataType::Boolean => match payload {
            "true" => TypedValue::Boolean(true),
            "false" => TypedValue::Boolean(false),
            other => return Err(CacheError::Parse(format!("invalid boolean '{}'", other))),
        },
        DataType::Number => TypedValue::Number(
            payload
                .parse::<f64>()
                .map_err(|e| CacheError::Parse(format!("invalid number '{}': {}", payload, e)))?,
        ),
        DataType::String => TypedValue::String(payload.to_string()),
        DataType::BigInt => TypedValue::BigInt(
            payload
                .parse::<BigInt>()
                .map_err(|e| CacheError::Parse(format!("invalid bigint '{}': {}", payload, e)))?,
        ),
    };
    Ok(value)
}

// == Record Encoding ==
/// Encodes a value as a single `<code>:<payload>` record.
pub fn encode_record(value: &TypedValue) -> Result<String> {
    let (data_type, payload) = serialize(value)?;
    Ok(format!("{}:{}", data_type.code(), payload))
}

/// Decodes a `<code>:<payload>` record.
pub fn decode_record(record: &str) -> Result<TypedValue> {
    let (code, payload) = record
        .split_once(':')
        .ok_or_else(|| CacheError::Parse("record is missing its type code".to_string()))?;
    let code = code
        .parse::<i64>()
        .map_err(|e| CacheError::Parse(format!("invalid type code '{}': {}", code, e)))?;
    unserialize(payload, code)
}
