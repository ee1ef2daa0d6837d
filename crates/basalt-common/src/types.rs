//! Column types and values.
//!
//! Every column is fixed width: `Int` and `Float` are 4 bytes, `Char(n)` is
//! exactly `n` bytes zero-padded. Comparison happens at the value layer so
//! index keys order correctly per column type.

use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Data types supported for table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Float,
    Char,
}

impl ColType {
    /// Returns the fixed byte width for this type, or None for `Char`,
    /// whose width is the declared column length.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColType::Int => Some(4),
            ColType::Float => Some(4),
            ColType::Char => None,
        }
    }
}

impl std::fmt::Display for ColType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColType::Int => "INT",
            ColType::Float => "FLOAT",
            ColType::Char => "CHAR",
        };
        f.write_str(s)
    }
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Str(String),
}

impl Value {
    /// Returns the column type of this value.
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::Float(_) => ColType::Float,
            Value::Str(_) => ColType::Char,
        }
    }

    /// Encodes the value into exactly `len` bytes, little-endian for
    /// numerics, zero-padded for strings.
    pub fn to_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self {
            Value::Int(v) => {
                if len != 4 {
                    return Err(BasaltError::Internal(format!(
                        "INT column must be 4 bytes, got {len}"
                    )));
                }
                buf.copy_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                if len != 4 {
                    return Err(BasaltError::Internal(format!(
                        "FLOAT column must be 4 bytes, got {len}"
                    )));
                }
                buf.copy_from_slice(&v.to_le_bytes());
            }
            Value::Str(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > len {
                    return Err(BasaltError::Internal(format!(
                        "string of {} bytes exceeds CHAR({len})",
                        bytes.len()
                    )));
                }
                buf[..bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(buf)
    }

    /// Decodes a value of the given type from a fixed-width slice.
    pub fn from_bytes(col_type: ColType, buf: &[u8]) -> Value {
        match col_type {
            ColType::Int => Value::Int(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ColType::Float => Value::Float(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ColType::Char => {
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Value::Str(String::from_utf8_lossy(&buf[..end]).into_owned())
            }
        }
    }

    /// Compares two values of the same type. Cross-type comparison is a
    /// catalog bug upstream and orders by discriminant.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Int(_), _) => Ordering::Less,
            (_, Value::Int(_)) => Ordering::Greater,
            (Value::Float(_), _) => Ordering::Less,
            (_, Value::Float(_)) => Ordering::Greater,
        }
    }
}

/// Compares two fixed-width encoded column values by type.
pub fn compare_encoded(col_type: ColType, a: &[u8], b: &[u8]) -> Ordering {
    Value::from_bytes(col_type, a).compare(&Value::from_bytes(col_type, b))
}
