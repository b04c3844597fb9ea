//! Typed values and their little-endian wire representation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SdoError;

/// CiA 301 basic data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Real32,
    Real64,
    VisibleString,
    OctetString,
    Domain,
}

impl DataType {
    /// Map a data type code, e.g. `0x0007` as written in an EDS `DataType=` line.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::Boolean),
            0x0002 => Some(Self::Int8),
            0x0003 => Some(Self::Int16),
            0x0004 => Some(Self::Int32),
            0x0005 => Some(Self::UInt8),
            0x0006 => Some(Self::UInt16),
            0x0007 => Some(Self::UInt32),
            0x0008 => Some(Self::Real32),
            0x0009 => Some(Self::VisibleString),
            0x000A => Some(Self::OctetString),
            0x000F => Some(Self::Domain),
            0x0011 => Some(Self::Real64),
            0x0015 => Some(Self::Int64),
            0x001B => Some(Self::UInt64),
            _ => None,
        }
    }

    /// Parse the textual form used in EDS files (`0x0007`, `7`).
    pub fn from_eds_type(eds_type: &str) -> Option<Self> {
        let eds_type = eds_type.trim();
        let code = match eds_type.strip_prefix("0x").or_else(|| eds_type.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok()?,
            None => eds_type.parse::<u16>().ok()?,
        };
        Self::from_code(code)
    }

    /// Encoded width in bytes, `None` for variable-length types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Boolean | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Real32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Real64 => Some(8),
            Self::VisibleString | Self::OctetString | Self::Domain => None,
        }
    }

    /// Normalize `value` to this type and produce the bytes to transmit.
    pub fn encode(self, value: &Value) -> Result<EncodedValue, SdoError> {
        let (value, raw) = match self {
            Self::Boolean => {
                let flag = match value {
                    Value::Bool(flag) => *flag,
                    Value::Unsigned(0) | Value::Signed(0) => false,
                    Value::Unsigned(1) | Value::Signed(1) => true,
                    other => return Err(mismatch(self, other)),
                };
                (Value::Bool(flag), vec![flag as u8])
            }
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => {
                let width = self.fixed_size().unwrap_or(8);
                let number = match value {
                    Value::Unsigned(n) => *n,
                    Value::Signed(n) if *n >= 0 => *n as u64,
                    other => return Err(mismatch(self, other)),
                };
                if width < 8 && number >> (width * 8) != 0 {
                    return Err(out_of_range(self, value));
                }
                (Value::Unsigned(number), number.to_le_bytes()[..width].to_vec())
            }
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => {
                let width = self.fixed_size().unwrap_or(8);
                let number = match value {
                    Value::Signed(n) => *n,
                    Value::Unsigned(n) => i64::try_from(*n).map_err(|_| out_of_range(self, value))?,
                    other => return Err(mismatch(self, other)),
                };
                let bits = (width * 8) as u32;
                if bits < 64 && (number < -(1i64 << (bits - 1)) || number >= 1i64 << (bits - 1)) {
                    return Err(out_of_range(self, value));
                }
                (Value::Signed(number), number.to_le_bytes()[..width].to_vec())
            }
            Self::Real32 => {
                let number = as_real(self, value)? as f32;
                (Value::Real(number as f64), number.to_le_bytes().to_vec())
            }
            Self::Real64 => {
                let number = as_real(self, value)?;
                (Value::Real(number), number.to_le_bytes().to_vec())
            }
            Self::VisibleString => match value {
                Value::Text(text) => (value.clone(), text.as_bytes().to_vec()),
                other => return Err(mismatch(self, other)),
            },
            Self::OctetString | Self::Domain => match value {
                Value::Bytes(bytes) => (value.clone(), bytes.clone()),
                Value::Text(text) => (Value::Bytes(text.as_bytes().to_vec()), text.as_bytes().to_vec()),
                other => return Err(mismatch(self, other)),
            },
        };

        Ok(EncodedValue {
            size: raw.len(),
            value,
            raw,
        })
    }

    /// Interpret received bytes as this type.
    pub fn decode(self, payload: &[u8]) -> Result<Value, SdoError> {
        if let Some(width) = self.fixed_size() {
            if payload.len() < width {
                return Err(SdoError::Value(format!(
                    "Insufficient data for {:?}: {} of {} bytes",
                    self,
                    payload.len(),
                    width
                )));
            }
        }

        let mut wide = [0u8; 8];
        let width = self.fixed_size().unwrap_or(0);
        wide[..width].copy_from_slice(&payload[..width]);

        let value = match self {
            Self::Boolean => Value::Bool(payload[0] != 0),
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => {
                Value::Unsigned(u64::from_le_bytes(wide))
            }
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => {
                // Sign-extend from the encoded width
                let shift = 64 - (width as u32) * 8;
                Value::Signed(i64::from_le_bytes(wide) << shift >> shift)
            }
            Self::Real32 => {
                Value::Real(f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as f64)
            }
            Self::Real64 => Value::Real(f64::from_le_bytes(wide)),
            Self::VisibleString => {
                let text = String::from_utf8_lossy(payload).trim_end_matches('\0').to_string();
                Value::Text(text)
            }
            Self::OctetString | Self::Domain => Value::Bytes(payload.to_vec()),
        };
        Ok(value)
    }

    /// Parse user input (command line, config) into a value of this type.
    ///
    /// Integers accept decimal or `0x` hex, octet strings accept hex bytes
    /// optionally separated by spaces.
    pub fn parse(self, text: &str) -> Result<Value, SdoError> {
        let text = text.trim();
        let invalid = || SdoError::Value(format!("'{}' is not a valid {:?}", text, self));

        match self {
            Self::Boolean => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(Value::Bool(true)),
                "0" | "false" | "off" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => {
                parse_unsigned(text).map(Value::Unsigned).ok_or_else(invalid)
            }
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => {
                let number = match text.strip_prefix('-') {
                    Some(rest) => parse_unsigned(rest)
                        .and_then(|n| i64::try_from(n).ok())
                        .map(|n| -n),
                    None => parse_unsigned(text).and_then(|n| i64::try_from(n).ok()),
                };
                number.map(Value::Signed).ok_or_else(invalid)
            }
            Self::Real32 | Self::Real64 => text.parse::<f64>().map(Value::Real).map_err(|_| invalid()),
            Self::VisibleString => Ok(Value::Text(text.to_string())),
            Self::OctetString | Self::Domain => {
                let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                if !digits.is_ascii() || digits.len() % 2 != 0 {
                    return Err(invalid());
                }
                (0..digits.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| invalid()))
                    .collect::<Result<Vec<u8>, _>>()
                    .map(Value::Bytes)
            }
        }
    }
}

fn parse_unsigned(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok(),
    }
}

fn as_real(data_type: DataType, value: &Value) -> Result<f64, SdoError> {
    match value {
        Value::Real(n) => Ok(*n),
        Value::Unsigned(n) => Ok(*n as f64),
        Value::Signed(n) => Ok(*n as f64),
        other => Err(mismatch(data_type, other)),
    }
}

fn mismatch(data_type: DataType, value: &Value) -> SdoError {
    SdoError::Value(format!("{:?} cannot hold {:?}", data_type, value))
}

fn out_of_range(data_type: DataType, value: &Value) -> SdoError {
    SdoError::Value(format!("{} out of range for {:?}", value, data_type))
}

/// A typed object dictionary value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Signed(v) => write!(f, "{}", v),
            Self::Real(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
            Self::Bytes(v) => write!(f, "{:02X?}", v),
        }
    }
}

/// Result of [`DataType::encode`]: the normalized value, its size and the
/// bytes actually transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    pub value: Value,
    pub size: usize,
    pub raw: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eds_type_codes() {
        assert_eq!(DataType::from_eds_type("0x0007"), Some(DataType::UInt32));
        assert_eq!(DataType::from_eds_type("0x0009"), Some(DataType::VisibleString));
        assert_eq!(DataType::from_eds_type("5"), Some(DataType::UInt8));
        assert_eq!(DataType::from_eds_type("0x001B"), Some(DataType::UInt64));
        assert_eq!(DataType::from_eds_type("0x0020"), None);
        assert_eq!(DataType::from_eds_type("bogus"), None);
    }

    #[test]
    fn test_encode_unsigned() {
        let encoded = DataType::UInt32.encode(&Value::Unsigned(0x0102_0304)).unwrap();
        assert_eq!(encoded.raw, vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(encoded.size, 4);

        let encoded = DataType::UInt16.encode(&Value::Signed(15)).unwrap();
        assert_eq!(encoded.value, Value::Unsigned(15));
        assert_eq!(encoded.raw, vec![15, 0]);
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        assert!(DataType::UInt8.encode(&Value::Unsigned(256)).is_err());
        assert!(DataType::UInt8.encode(&Value::Signed(-1)).is_err());
        assert!(DataType::Int8.encode(&Value::Signed(128)).is_err());
        assert!(DataType::Int8.encode(&Value::Signed(-128)).is_ok());
        assert!(DataType::UInt32.encode(&Value::Text("1".into())).is_err());
    }

    #[test]
    fn test_encode_signed_and_real() {
        let encoded = DataType::Int16.encode(&Value::Signed(-2)).unwrap();
        assert_eq!(encoded.raw, vec![0xFE, 0xFF]);

        let encoded = DataType::Real32.encode(&Value::Unsigned(2)).unwrap();
        assert_eq!(encoded.value, Value::Real(2.0));
        assert_eq!(encoded.raw, 2.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_encode_string() {
        let encoded = DataType::VisibleString
            .encode(&Value::Text("MockCANopenNode".into()))
            .unwrap();
        assert_eq!(encoded.size, 15);
        assert_eq!(encoded.raw, b"MockCANopenNode".to_vec());
    }

    #[test]
    fn test_decode_sign_extends() {
        assert_eq!(DataType::Int16.decode(&[0xFE, 0xFF]).unwrap(), Value::Signed(-2));
        assert_eq!(DataType::Int8.decode(&[0x7F]).unwrap(), Value::Signed(127));
        assert_eq!(
            DataType::UInt32.decode(&[0x91, 0x01, 0, 0]).unwrap(),
            Value::Unsigned(0x191)
        );
    }

    #[test]
    fn test_decode_too_short() {
        assert!(DataType::UInt32.decode(&[1, 2]).is_err());
    }

    #[test]
    fn test_decode_string_trims_nul() {
        assert_eq!(
            DataType::VisibleString.decode(b"abc\0\0").unwrap(),
            Value::Text("abc".into())
        );
    }

    #[test]
    fn test_parse_user_input() {
        assert_eq!(DataType::UInt16.parse("0x1F").unwrap(), Value::Unsigned(31));
        assert_eq!(DataType::Int32.parse("-42").unwrap(), Value::Signed(-42));
        assert_eq!(DataType::Boolean.parse("true").unwrap(), Value::Bool(true));
        assert_eq!(
            DataType::OctetString.parse("01 ab FF").unwrap(),
            Value::Bytes(vec![0x01, 0xAB, 0xFF])
        );
        assert!(DataType::UInt8.parse("abc").is_err());
        assert!(DataType::OctetString.parse("abc").is_err());
    }
}
