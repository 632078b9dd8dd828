//! Core CAN-FIX datatypes and value conversion
//!
//! Every multi-byte CAN-FIX quantity travels little-endian. Integer types may
//! carry a multiplier: physical = raw * multiplier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DefsError, DefsResult};
use crate::precision::{decimals_for, round_for_multiplier};

/// CAN-FIX primitive datatype
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// Single ASCII character per byte
    Char,
    /// 8 bit flags
    Byte,
    /// 16 bit flags
    Word,
    /// Signed 8-bit integer
    Short,
    /// Unsigned 8-bit integer
    Ushort,
    /// Signed 16-bit integer
    Int,
    /// Unsigned 16-bit integer
    #[default]
    Uint,
    /// Signed 32-bit integer
    Dint,
    /// Unsigned 32-bit integer
    Udint,
    /// 32-bit IEEE 754 float
    Float,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Char => "CHAR",
            DataType::Byte => "BYTE",
            DataType::Word => "WORD",
            DataType::Short => "SHORT",
            DataType::Ushort => "USHORT",
            DataType::Int => "INT",
            DataType::Uint => "UINT",
            DataType::Dint => "DINT",
            DataType::Udint => "UDINT",
            DataType::Float => "FLOAT",
        };
        f.write_str(s)
    }
}

impl FromStr for DataType {
    type Err = DefsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CHAR" => Ok(DataType::Char),
            "BYTE" => Ok(DataType::Byte),
            "WORD" => Ok(DataType::Word),
            "SHORT" => Ok(DataType::Short),
            "USHORT" => Ok(DataType::Ushort),
            "INT" => Ok(DataType::Int),
            "UINT" => Ok(DataType::Uint),
            "DINT" => Ok(DataType::Dint),
            "UDINT" => Ok(DataType::Udint),
            "FLOAT" => Ok(DataType::Float),
            _ => Err(DefsError::UnknownDataType(s.to_string())),
        }
    }
}

impl DataType {
    /// Size of one element on the wire
    pub fn byte_size(&self) -> usize {
        match self {
            DataType::Char | DataType::Byte | DataType::Short | DataType::Ushort => 1,
            DataType::Word | DataType::Int | DataType::Uint => 2,
            DataType::Dint | DataType::Udint | DataType::Float => 4,
        }
    }

    /// Integer types honour the multiplier
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Short
                | DataType::Ushort
                | DataType::Int
                | DataType::Uint
                | DataType::Dint
                | DataType::Udint
        )
    }

    pub fn is_bitfield(&self) -> bool {
        matches!(self, DataType::Byte | DataType::Word)
    }

    fn range(&self) -> (i64, i64) {
        match self {
            DataType::Short => (i8::MIN as i64, i8::MAX as i64),
            DataType::Ushort | DataType::Char | DataType::Byte => (0, u8::MAX as i64),
            DataType::Int => (i16::MIN as i64, i16::MAX as i64),
            DataType::Uint | DataType::Word => (0, u16::MAX as i64),
            DataType::Dint => (i32::MIN as i64, i32::MAX as i64),
            DataType::Udint => (0, u32::MAX as i64),
            DataType::Float => (i64::MIN, i64::MAX),
        }
    }

    /// Decode wire bytes into a value
    ///
    /// `CHAR` consumes every byte as text; everything else reads one element.
    pub fn decode(&self, data: &[u8], multiplier: f64) -> DefsResult<Value> {
        if *self == DataType::Char {
            let text: String = data
                .iter()
                .take_while(|b| **b != 0)
                .map(|b| *b as char)
                .collect();
            return Ok(Value::Text(text));
        }

        let size = self.byte_size();
        if data.len() < size {
            return Err(DefsError::DataTooShort {
                datatype: *self,
                expected: size,
                actual: data.len(),
            });
        }
        let d = &data[..size];

        let raw: i64 = match self {
            DataType::Byte => return Ok(Value::Bits(bits_from(d[0] as u32, 8))),
            DataType::Word => {
                let w = u16::from_le_bytes([d[0], d[1]]);
                return Ok(Value::Bits(bits_from(w as u32, 16)));
            }
            DataType::Float => {
                let f = f32::from_le_bytes([d[0], d[1], d[2], d[3]]);
                return Ok(Value::Float(f as f64));
            }
            DataType::Short => d[0] as i8 as i64,
            DataType::Ushort => d[0] as i64,
            DataType::Int => i16::from_le_bytes([d[0], d[1]]) as i64,
            DataType::Uint => u16::from_le_bytes([d[0], d[1]]) as i64,
            DataType::Dint => i32::from_le_bytes([d[0], d[1], d[2], d[3]]) as i64,
            DataType::Udint => u32::from_le_bytes([d[0], d[1], d[2], d[3]]) as i64,
            DataType::Char => d[0] as i64,
        };

        if multiplier == 1.0 {
            Ok(Value::Int(raw))
        } else {
            Ok(Value::Float(round_for_multiplier(
                raw as f64 * multiplier,
                multiplier,
            )))
        }
    }

    /// Encode a value into wire bytes
    pub fn encode(&self, value: &Value, multiplier: f64) -> DefsResult<Vec<u8>> {
        match self {
            DataType::Char => match value {
                Value::Text(s) => Ok(s.bytes().collect()),
                Value::Int(i) if (0..=255).contains(i) => Ok(vec![*i as u8]),
                other => Err(self.mismatch(other)),
            },
            DataType::Byte | DataType::Word => {
                let raw = match value {
                    Value::Bits(bits) => bits
                        .iter()
                        .enumerate()
                        .take(self.byte_size() * 8)
                        .fold(0u32, |acc, (i, b)| if *b { acc | (1 << i) } else { acc }),
                    Value::Int(i) => self.check_range(*i as f64)? as u32,
                    other => return Err(self.mismatch(other)),
                };
                let bytes = raw.to_le_bytes();
                Ok(bytes[..self.byte_size()].to_vec())
            }
            DataType::Float => {
                let f = value.as_f64().ok_or_else(|| self.mismatch(value))?;
                Ok((f as f32).to_le_bytes().to_vec())
            }
            _ => {
                let physical = value.as_f64().ok_or_else(|| self.mismatch(value))?;
                let divisor = if multiplier == 0.0 { 1.0 } else { multiplier };
                let raw = self.check_range((physical / divisor).round())?;
                let bytes = raw.to_le_bytes();
                Ok(bytes[..self.byte_size()].to_vec())
            }
        }
    }

    /// Parse user text into a value of this type
    pub fn parse_value(&self, text: &str) -> DefsResult<Value> {
        let t = text.trim();
        match self {
            DataType::Char => Ok(Value::Text(t.to_string())),
            DataType::Float => t
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| DefsError::InvalidNumber(text.to_string())),
            DataType::Byte | DataType::Word if t.len() == self.byte_size() * 8 && is_bit_string(t) => {
                // MSB first, the way a bit pattern is written
                Ok(Value::Bits(t.chars().rev().map(|c| c == '1').collect()))
            }
            _ => match crate::error::parse_int(t) {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => t
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| DefsError::InvalidNumber(text.to_string())),
            },
        }
    }

    fn check_range(&self, raw: f64) -> DefsResult<i64> {
        let (min, max) = self.range();
        if raw < min as f64 || raw > max as f64 {
            return Err(DefsError::ValueOutOfRange {
                value: raw,
                datatype: *self,
            });
        }
        Ok(raw as i64)
    }

    fn mismatch(&self, value: &Value) -> DefsError {
        DefsError::TypeMismatch {
            datatype: *self,
            found: value.kind().to_string(),
        }
    }
}

fn bits_from(raw: u32, count: usize) -> Vec<bool> {
    (0..count).map(|i| raw & (1 << i) != 0).collect()
}

fn is_bit_string(s: &str) -> bool {
    s.chars().all(|c| c == '0' || c == '1')
}

/// Decoded CAN-FIX value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// Flag bits, least significant first
    Bits(Vec<bool>),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Bits(_) => "bit array",
            Value::Text(_) => "text",
        }
    }

    /// Human readable form, rounded for the multiplier that produced it
    pub fn format(&self, multiplier: f64) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                let decimals = decimals_for(multiplier) as usize;
                format!("{:.*}", decimals, f)
            }
            // Printed MSB first, matching how the flags are documented
            Value::Bits(bits) => bits
                .iter()
                .rev()
                .map(|b| if *b { '1' } else { '0' })
                .collect(),
            Value::Text(s) => s.clone(),
        }
    }

    /// Formatted value followed by its units, if any
    pub fn format_with_units(&self, multiplier: f64, units: &str) -> String {
        let v = self.format(multiplier);
        if units.is_empty() {
            v
        } else {
            format!("{} {}", v, units)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(DataType::Short, &[0xFE], Value::Int(-2))]
    #[case(DataType::Ushort, &[0xFE], Value::Int(254))]
    #[case(DataType::Int, &[0x18, 0xFC], Value::Int(-1000))]
    #[case(DataType::Uint, &[0xE8, 0x03], Value::Int(1000))]
    #[case(DataType::Dint, &[0xFF, 0xFF, 0xFF, 0xFF], Value::Int(-1))]
    #[case(DataType::Udint, &[0x00, 0x00, 0x01, 0x00], Value::Int(65536))]
    fn test_decode_integers(#[case] dt: DataType, #[case] data: &[u8], #[case] expected: Value) {
        assert_eq!(dt.decode(data, 1.0).unwrap(), expected);
    }

    #[test]
    fn test_decode_with_multiplier() {
        let v = DataType::Uint.decode(&[0x7B, 0x00], 0.1).unwrap();
        assert_eq!(v, Value::Float(12.3));
        assert_eq!(v.format(0.1), "12.3");
    }

    #[test]
    fn test_decode_float() {
        let v = DataType::Float.decode(&1.5f32.to_le_bytes(), 1.0).unwrap();
        assert_eq!(v, Value::Float(1.5));
    }

    #[test]
    fn test_decode_bits() {
        let v = DataType::Byte.decode(&[0b0000_0101], 1.0).unwrap();
        let Value::Bits(bits) = &v else {
            panic!("expected bits, got {:?}", v);
        };
        assert_eq!(bits.len(), 8);
        assert!(bits[0] && !bits[1] && bits[2]);
        assert_eq!(v.format(1.0), "00000101");
    }

    #[test]
    fn test_decode_char_stops_at_nul() {
        let v = DataType::Char.decode(b"N12\0\0", 1.0).unwrap();
        assert_eq!(v, Value::Text("N12".to_string()));
    }

    #[test]
    fn test_decode_too_short() {
        let err = DataType::Dint.decode(&[1, 2], 1.0).unwrap_err();
        assert!(matches!(err, DefsError::DataTooShort { expected: 4, .. }));
    }

    #[test]
    fn test_encode_applies_multiplier() {
        let bytes = DataType::Uint.encode(&Value::Float(12.3), 0.1).unwrap();
        assert_eq!(bytes, vec![0x7B, 0x00]);
    }

    #[test]
    fn test_encode_out_of_range() {
        let err = DataType::Ushort.encode(&Value::Int(300), 1.0).unwrap_err();
        assert!(matches!(err, DefsError::ValueOutOfRange { .. }));
        assert!(DataType::Uint.encode(&Value::Int(-1), 1.0).is_err());
    }

    #[test]
    fn test_encode_bits() {
        let bits = Value::Bits(vec![true, false, true]);
        assert_eq!(DataType::Byte.encode(&bits, 1.0).unwrap(), vec![0x05]);
        assert_eq!(DataType::Word.encode(&Value::Int(0x0102), 1.0).unwrap(), vec![0x02, 0x01]);
    }

    #[test]
    fn test_encode_type_mismatch() {
        let err = DataType::Int
            .encode(&Value::Text("abc".into()), 1.0)
            .unwrap_err();
        assert!(matches!(err, DefsError::TypeMismatch { .. }));
    }

    #[test]
    fn test_datatype_names() {
        assert_eq!("uint".parse::<DataType>().unwrap(), DataType::Uint);
        assert_eq!("FLOAT".parse::<DataType>().unwrap(), DataType::Float);
        assert!("LONG".parse::<DataType>().is_err());
        assert_eq!(DataType::Udint.to_string(), "UDINT");
        let json = serde_json::to_string(&DataType::Ushort).unwrap();
        assert_eq!(json, "\"USHORT\"");
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(DataType::Uint.parse_value("0x10").unwrap(), Value::Int(16));
        assert_eq!(DataType::Uint.parse_value("1.5").unwrap(), Value::Float(1.5));
        assert_eq!(DataType::Float.parse_value("2").unwrap(), Value::Float(2.0));
        assert_eq!(
            DataType::Byte.parse_value("00000011").unwrap(),
            Value::Bits(vec![true, true, false, false, false, false, false, false])
        );
        assert!(DataType::Int.parse_value("x").is_err());
    }

    #[test]
    fn test_format_with_units() {
        assert_eq!(Value::Int(5).format_with_units(1.0, "knots"), "5 knots");
        assert_eq!(Value::Int(5).format_with_units(1.0, ""), "5");
    }
}
