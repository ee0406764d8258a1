//! The typed argument union for compute-module calls.
//!
//! Each variant maps deterministically to a fixed-arity sequence of 64-bit
//! machine words: scalars become one word, variable-length kinds become a
//! pointer/length pair backed by a fresh arena write. The set is closed and
//! matched exhaustively; the dynamic ingestion path (`from_json`) is the one
//! place an open value is narrowed into it.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

/// Maximum f64 that still widens into the u64 range (2^64)
const WORD_RANGE: f64 = 18_446_744_073_709_551_616.0;

/// A numeric value passed as a single machine word
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// An unsigned 64-bit integer, passed through unchanged
    Int(u64),
    /// A float; must be integral and within u64 range to widen exactly
    Float(f64),
}

impl ScalarValue {
    /// Widen to a 64-bit machine word
    ///
    /// # Errors
    ///
    /// Returns `ArgumentRange` if the value is fractional, negative,
    /// non-finite, or outside the u64 range. Widening is exact for every
    /// accepted input.
    pub fn widen(&self) -> BridgeResult<u64> {
        match *self {
            Self::Int(v) => Ok(v),
            Self::Float(f) => {
                if !f.is_finite() || f.fract() != 0.0 || f < 0.0 || f >= WORD_RANGE {
                    return Err(BridgeError::ArgumentRange {
                        value: f.to_string(),
                    });
                }
                Ok(f as u64)
            }
        }
    }
}

/// A typed argument for a compute-module call
///
/// Arguments are immutable once constructed; their marshalled bytes are
/// write-once into the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    /// Integral scalar, one machine word
    Scalar(ScalarValue),
    /// UTF-8 text, marshalled as pointer + byte length
    Text(String),
    /// Raw bytes, marshalled as pointer + byte length
    Bytes(Vec<u8>),
    /// Numeric sequence, each element widened to a little-endian 64-bit
    /// word; marshalled as pointer + element count
    Sequence(Vec<ScalarValue>),
}

impl Argument {
    /// Narrow a dynamic JSON value into the closed argument set
    ///
    /// Numbers become scalars, strings text, arrays of numbers sequences.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArgumentKind` for booleans, nulls, objects, and
    /// non-numeric array elements; `ArgumentRange` for negative integers.
    pub fn from_json(value: &serde_json::Value) -> BridgeResult<Self> {
        use serde_json::Value;
        match value {
            Value::Number(n) => Ok(Self::Scalar(scalar_from_number(n)?)),
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Number(n) => elements.push(scalar_from_number(n)?),
                        other => {
                            return Err(BridgeError::UnsupportedArgumentKind {
                                kind: format!("array of {}", kind_name(other)),
                            });
                        }
                    }
                }
                Ok(Self::Sequence(elements))
            }
            other => Err(BridgeError::UnsupportedArgumentKind {
                kind: kind_name(other).to_string(),
            }),
        }
    }
}

fn scalar_from_number(n: &serde_json::Number) -> BridgeResult<ScalarValue> {
    if let Some(v) = n.as_u64() {
        return Ok(ScalarValue::Int(v));
    }
    if n.as_i64().is_some() {
        // negative integer; has no exact u64 widening
        return Err(BridgeError::ArgumentRange {
            value: n.to_string(),
        });
    }
    n.as_f64()
        .map(ScalarValue::Float)
        .ok_or_else(|| BridgeError::ArgumentRange {
            value: n.to_string(),
        })
}

fn kind_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl From<u64> for Argument {
    fn from(v: u64) -> Self {
        Self::Scalar(ScalarValue::Int(v))
    }
}

impl From<f64> for Argument {
    fn from(v: f64) -> Self {
        Self::Scalar(ScalarValue::Float(v))
    }
}

impl From<&str> for Argument {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Argument {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Argument {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}
