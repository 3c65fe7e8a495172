//! Scalar value kinds and their controller byte layout.
//!
//! This module defines [`ValueKind`], the closed set of scalar types a
//! [`TypedVar`](crate::TypedVar) can hold, and [`Value`], a decoded scalar.
//! Each kind carries its bit width, its bit alignment inside a data block and
//! its encode/decode rules.
//!
//! # Kinds Overview
//!
//! | Kind | Width (bits) | Alignment (bits) | Controller bytes |
//! |------|:------------:|:----------------:|------------------|
//! | Bool | 1 | 1 | 1 byte, value in bit `offset % 8` |
//! | Int16 | 16 | 16 | 2 bytes, big-endian |
//! | Int32 | 32 | 16 | 4 bytes, big-endian |
//! | Float32 | 32 | 16 | 4 bytes, big-endian IEEE 754 |
//!
//! 32-bit kinds align on 16 bits, matching word addressing on the controller.
//!
//! # Example
//!
//! ```
//! use plc_gateway::{Value, ValueKind};
//!
//! assert_eq!(ValueKind::Int32.bit_width(), 32);
//! assert_eq!(ValueKind::Int32.alignment(), 16);
//!
//! let bytes = Value::Int16(-2).encode(0);
//! assert_eq!(bytes, vec![0xFF, 0xFE]);
//!
//! let decoded = Value::decode(ValueKind::Int16, &bytes, 0).unwrap();
//! assert_eq!(decoded, Value::Int16(-2));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::utils::{get_bit, split_bit_offset, with_bit};

/// Scalar kinds that can be laid out inside a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Single bit.
    Bool,
    /// Signed 16-bit integer (INT).
    Int16,
    /// Signed 32-bit integer (DINT).
    Int32,
    /// 32-bit IEEE 754 float (REAL).
    Float32,
}

impl ValueKind {
    /// Returns the number of bits a value of this kind occupies.
    ///
    /// This is also the bit width sent in write-back commands.
    pub fn bit_width(self) -> u8 {
        match self {
            ValueKind::Bool => 1,
            ValueKind::Int16 => 16,
            ValueKind::Int32 => 32,
            ValueKind::Float32 => 32,
        }
    }

    /// Returns the bit boundary a value of this kind must start on.
    pub fn alignment(self) -> u32 {
        match self {
            ValueKind::Bool => 1,
            ValueKind::Int16 => 16,
            ValueKind::Int32 => 16,
            ValueKind::Float32 => 16,
        }
    }

    /// Returns the number of bytes copied out of the block to decode a value.
    ///
    /// Booleans occupy a single bit but are carried in one whole byte.
    pub fn byte_len(self) -> usize {
        match self {
            ValueKind::Bool => 1,
            other => other.bit_width() as usize / 8,
        }
    }

    /// Returns the zero value of this kind.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int16 => Value::Int16(0),
            ValueKind::Int32 => Value::Int32(0),
            ValueKind::Float32 => Value::Float32(0.0),
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Int16 => write!(f, "int16"),
            ValueKind::Int32 => write!(f, "int32"),
            ValueKind::Float32 => write!(f, "float32"),
        }
    }
}

/// A decoded scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// 16-bit integer value.
    Int16(i16),
    /// 32-bit integer value.
    Int32(i32),
    /// 32-bit float value.
    Float32(f32),
}

impl Value {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int16(_) => ValueKind::Int16,
            Value::Int32(_) => ValueKind::Int32,
            Value::Float32(_) => ValueKind::Float32,
        }
    }

    /// Compares two values bit for bit.
    ///
    /// Unlike `==`, a NaN is the same as an identical NaN, so a steady NaN
    /// reading is not reported as a change on every cycle.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    /// Encodes the value into its controller byte representation.
    ///
    /// Numeric kinds are big-endian. A boolean becomes one byte holding only
    /// bit `bit_offset % 8`, set when the value is `true`.
    ///
    /// # Example
    ///
    /// ```
    /// use plc_gateway::Value;
    ///
    /// assert_eq!(Value::Bool(true).encode(10), vec![0b0000_0100]);
    /// assert_eq!(Value::Bool(false).encode(10), vec![0x00]);
    /// assert_eq!(Value::Int32(1).encode(0), vec![0, 0, 0, 1]);
    /// ```
    pub fn encode(&self, bit_offset: u32) -> Vec<u8> {
        match *self {
            Value::Bool(v) => vec![with_bit(0, (bit_offset % 8) as u8, v)],
            Value::Int16(v) => v.to_be_bytes().to_vec(),
            Value::Int32(v) => v.to_be_bytes().to_vec(),
            Value::Float32(v) => v.to_be_bytes().to_vec(),
        }
    }

    /// Decodes a value of `kind` located at `bit_offset` inside `block`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the value would extend
    /// past the end of `block`.
    pub fn decode(kind: ValueKind, block: &[u8], bit_offset: u32) -> Result<Value> {
        let (byte_offset, bit) = split_bit_offset(bit_offset);
        let end = byte_offset + kind.byte_len();
        let bytes = block.get(byte_offset..end).ok_or_else(|| {
            GatewayError::invalid_parameter(
                "bit_offset",
                format!(
                    "{} at bit {} needs bytes {}..{}, block has {}",
                    kind,
                    bit_offset,
                    byte_offset,
                    end,
                    block.len()
                ),
            )
        })?;

        Ok(match kind {
            ValueKind::Bool => Value::Bool(get_bit(bytes[0], bit)),
            ValueKind::Int16 => Value::Int16(i16::from_be_bytes([bytes[0], bytes[1]])),
            ValueKind::Int32 => {
                Value::Int32(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            ValueKind::Float32 => {
                Value::Float32(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes `value` into a zeroed block at `bit_offset` and decodes it back.
    fn roundtrip(value: Value, bit_offset: u32) -> Value {
        let mut block = vec![0u8; 16];
        let (byte_offset, _) = split_bit_offset(bit_offset);
        let bytes = value.encode(bit_offset);
        block[byte_offset..byte_offset + bytes.len()].copy_from_slice(&bytes);
        Value::decode(value.kind(), &block, bit_offset).unwrap()
    }

    #[test]
    fn test_widths_and_alignment() {
        assert_eq!(ValueKind::Bool.bit_width(), 1);
        assert_eq!(ValueKind::Int16.bit_width(), 16);
        assert_eq!(ValueKind::Int32.bit_width(), 32);
        assert_eq!(ValueKind::Float32.bit_width(), 32);

        assert_eq!(ValueKind::Bool.alignment(), 1);
        assert_eq!(ValueKind::Int16.alignment(), 16);
        assert_eq!(ValueKind::Int32.alignment(), 16);
        assert_eq!(ValueKind::Float32.alignment(), 16);
    }

    #[test]
    fn test_byte_len() {
        assert_eq!(ValueKind::Bool.byte_len(), 1);
        assert_eq!(ValueKind::Int16.byte_len(), 2);
        assert_eq!(ValueKind::Int32.byte_len(), 4);
        assert_eq!(ValueKind::Float32.byte_len(), 4);
    }

    #[test]
    fn test_bool_roundtrip_bit_positions() {
        for bit_offset in [0, 7, 8, 15, 42] {
            assert_eq!(roundtrip(Value::Bool(true), bit_offset), Value::Bool(true));
            assert_eq!(roundtrip(Value::Bool(false), bit_offset), Value::Bool(false));
        }
    }

    #[test]
    fn test_bool_encoding_positions_bit() {
        assert_eq!(Value::Bool(true).encode(0), vec![0x01]);
        assert_eq!(Value::Bool(true).encode(7), vec![0x80]);
        assert_eq!(Value::Bool(true).encode(15), vec![0x80]);
    }

    #[test]
    fn test_bool_decode_ignores_neighbour_bits() {
        let block = [0b1111_1011];
        assert_eq!(Value::decode(ValueKind::Bool, &block, 2).unwrap(), Value::Bool(false));
        assert_eq!(Value::decode(ValueKind::Bool, &block, 3).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_int16_roundtrip_boundaries() {
        for v in [0, -1, 1, i16::MAX, i16::MIN] {
            assert_eq!(roundtrip(Value::Int16(v), 16), Value::Int16(v));
        }
    }

    #[test]
    fn test_int32_roundtrip_boundaries() {
        for v in [0, -1, 1, i32::MAX, i32::MIN, -123_456] {
            assert_eq!(roundtrip(Value::Int32(v), 32), Value::Int32(v));
        }
    }

    #[test]
    fn test_float32_roundtrip() {
        for v in [0.0f32, -0.0, 1.5, -273.15, f32::MAX, f32::MIN, f32::INFINITY, f32::NEG_INFINITY] {
            let decoded = roundtrip(Value::Float32(v), 48);
            assert!(decoded.same_as(&Value::Float32(v)), "{} != {}", decoded, v);
        }
    }

    #[test]
    fn test_float32_nan_is_bit_exact() {
        let nan = f32::from_bits(0x7FC0_0001);
        let decoded = roundtrip(Value::Float32(nan), 0);
        match decoded {
            Value::Float32(v) => assert_eq!(v.to_bits(), nan.to_bits()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoded.same_as(&Value::Float32(nan)));
        assert_ne!(decoded, Value::Float32(nan));
    }

    #[test]
    fn test_numeric_encoding_is_big_endian() {
        assert_eq!(Value::Int16(0x1234).encode(0), hex::decode("1234").unwrap());
        assert_eq!(Value::Int32(0x0102_0304).encode(0), hex::decode("01020304").unwrap());
        assert_eq!(Value::Float32(1.0).encode(0), hex::decode("3f800000").unwrap());
    }

    #[test]
    fn test_decode_out_of_bounds() {
        let block = [0u8; 3];
        assert!(Value::decode(ValueKind::Int32, &block, 0).is_err());
        assert!(Value::decode(ValueKind::Int16, &block, 16).is_err());
        assert!(Value::decode(ValueKind::Bool, &block, 24).is_err());
        assert!(Value::decode(ValueKind::Int16, &block, 8).is_ok());
    }

    #[test]
    fn test_same_as() {
        assert!(Value::Int16(3).same_as(&Value::Int16(3)));
        assert!(!Value::Int16(3).same_as(&Value::Int32(3)));
        assert!(!Value::Float32(0.0).same_as(&Value::Float32(-0.0)));
    }

    #[test]
    fn test_kind_display_and_zero() {
        assert_eq!(ValueKind::Float32.to_string(), "float32");
        assert_eq!(ValueKind::Bool.zero(), Value::Bool(false));
        assert_eq!(Value::from(7i32).kind(), ValueKind::Int32);
    }
}
