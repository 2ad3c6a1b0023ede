//! Decoder for the binary JSON representation used in row images.

use serde_json::{Map, Number, Value as Json};

use crate::error::{DecodeError, DecodeResult};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0A;
const DOUBLE: u8 = 0x0B;
const STRING: u8 = 0x0C;
const OPAQUE: u8 = 0x0F;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// Parse a binary JSON document. An empty document is JSON `null`.
pub fn parse_json(data: &[u8]) -> DecodeResult<Json> {
    match data.split_first() {
        None => Ok(Json::Null),
        Some((&t, rest)) => parse_value(t, rest),
    }
}

fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::Malformed(format!("json: {}", msg.into()))
}

fn slice(data: &[u8], start: usize, len: usize) -> DecodeResult<&[u8]> {
    data.get(start..start + len)
        .ok_or_else(|| malformed(format!("offset {start}+{len} beyond {}", data.len())))
}

fn read_u16(data: &[u8], at: usize) -> DecodeResult<u16> {
    let b = slice(data, at, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> DecodeResult<u32> {
    let b = slice(data, at, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_offset(data: &[u8], at: usize, large: bool) -> DecodeResult<usize> {
    if large {
        Ok(read_u32(data, at)? as usize)
    } else {
        Ok(usize::from(read_u16(data, at)?))
    }
}

fn parse_value(t: u8, data: &[u8]) -> DecodeResult<Json> {
    match t {
        SMALL_OBJECT => parse_object(data, false),
        LARGE_OBJECT => parse_object(data, true),
        SMALL_ARRAY => parse_array(data, false),
        LARGE_ARRAY => parse_array(data, true),
        LITERAL => parse_literal(*data.first().ok_or_else(|| malformed("empty literal"))?),
        INT16 => Ok(Json::from(read_u16(data, 0)? as i16)),
        UINT16 => Ok(Json::from(read_u16(data, 0)?)),
        INT32 => Ok(Json::from(read_u32(data, 0)? as i32)),
        UINT32 => Ok(Json::from(read_u32(data, 0)?)),
        INT64 => {
            let b = slice(data, 0, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(Json::from(i64::from_le_bytes(raw)))
        }
        UINT64 => {
            let b = slice(data, 0, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(Json::from(u64::from_le_bytes(raw)))
        }
        DOUBLE => {
            let b = slice(data, 0, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(Number::from_f64(f64::from_le_bytes(raw))
                .map(Json::Number)
                .unwrap_or(Json::Null))
        }
        STRING => {
            let (len, used) = read_var_len(data)?;
            let bytes = slice(data, used, len)?;
            Ok(Json::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => {
            let (len, used) = read_var_len(data.get(1..).unwrap_or_default())?;
            let bytes = slice(data, 1 + used, len)?;
            Ok(Json::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        other => Err(malformed(format!("unknown value type 0x{other:02X}"))),
    }
}

fn parse_literal(b: u8) -> DecodeResult<Json> {
    match b {
        LITERAL_NULL => Ok(Json::Null),
        LITERAL_TRUE => Ok(Json::Bool(true)),
        LITERAL_FALSE => Ok(Json::Bool(false)),
        other => Err(malformed(format!("unknown literal 0x{other:02X}"))),
    }
}

/// Values of these types are stored in the value entry itself.
fn is_inlined(t: u8, large: bool) -> bool {
    match t {
        LITERAL | INT16 | UINT16 => true,
        INT32 | UINT32 => large,
        _ => false,
    }
}

fn parse_entry(data: &[u8], entry_at: usize, large: bool) -> DecodeResult<Json> {
    let t = *data
        .get(entry_at)
        .ok_or_else(|| malformed("value entry out of range"))?;
    let value_at = entry_at + 1;

    if is_inlined(t, large) {
        let width = if large { 4 } else { 2 };
        return parse_value(t, slice(data, value_at, width)?);
    }

    let offset = read_offset(data, value_at, large)?;
    let value = data
        .get(offset..)
        .ok_or_else(|| malformed(format!("value offset {offset} out of range")))?;
    parse_value(t, value)
}

fn parse_object(data: &[u8], large: bool) -> DecodeResult<Json> {
    let width = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let key_entry_size = width + 2;
    let value_entry_size = 1 + width;
    let keys_at = 2 * width;
    let values_at = keys_at + count * key_entry_size;

    let mut map = Map::with_capacity(count);
    for i in 0..count {
        let entry = keys_at + i * key_entry_size;
        let key_offset = read_offset(data, entry, large)?;
        let key_len = usize::from(read_u16(data, entry + width)?);
        let key = String::from_utf8_lossy(slice(data, key_offset, key_len)?).into_owned();
        let value = parse_entry(data, values_at + i * value_entry_size, large)?;
        map.insert(key, value);
    }

    Ok(Json::Object(map))
}

fn parse_array(data: &[u8], large: bool) -> DecodeResult<Json> {
    let width = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let values_at = 2 * width;
    let value_entry_size = 1 + width;

    (0..count)
        .map(|i| parse_entry(data, values_at + i * value_entry_size, large))
        .collect::<DecodeResult<Vec<_>>>()
        .map(Json::Array)
}

/// Variable-length integer: 7 bits per byte, high bit set on all but the
/// last byte. Returns the value and the number of bytes consumed.
fn read_var_len(data: &[u8]) -> DecodeResult<(usize, usize)> {
    let mut len = 0usize;
    for (i, b) in data.iter().take(5).enumerate() {
        len |= usize::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }
    Err(malformed("bad variable length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(parse_json(&[]).unwrap(), Json::Null);
        assert_eq!(parse_json(&[LITERAL, LITERAL_TRUE]).unwrap(), Json::Bool(true));
        assert_eq!(parse_json(&[INT16, 0xFE, 0xFF]).unwrap(), Json::from(-2));
        assert_eq!(
            parse_json(&[STRING, 3, b'a', b'b', b'c']).unwrap(),
            Json::from("abc")
        );
        let mut double = vec![DOUBLE];
        double.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(parse_json(&double).unwrap(), Json::from(1.5));
    }

    #[test]
    fn test_small_object() {
        // {"a": 1, "b": "x"}
        let mut obj = Vec::new();
        obj.extend_from_slice(&2u16.to_le_bytes()); // count
        obj.extend_from_slice(&0u16.to_le_bytes()); // size, unused by the reader
        // key entries start at 4, value entries at 4 + 2*4 = 12, keys at 12 + 2*3 = 18
        obj.extend_from_slice(&18u16.to_le_bytes());
        obj.extend_from_slice(&1u16.to_le_bytes());
        obj.extend_from_slice(&19u16.to_le_bytes());
        obj.extend_from_slice(&1u16.to_le_bytes());
        obj.push(INT16);
        obj.extend_from_slice(&1u16.to_le_bytes());
        obj.push(STRING);
        obj.extend_from_slice(&20u16.to_le_bytes());
        obj.extend_from_slice(b"ab");
        obj.extend_from_slice(&[1, b'x']);

        let mut doc = vec![SMALL_OBJECT];
        doc.extend_from_slice(&obj);
        assert_eq!(
            parse_json(&doc).unwrap(),
            serde_json::json!({"a": 1, "b": "x"})
        );
    }

    #[test]
    fn test_small_array() {
        // [true, null]
        let mut arr = Vec::new();
        arr.extend_from_slice(&2u16.to_le_bytes());
        arr.extend_from_slice(&0u16.to_le_bytes());
        arr.push(LITERAL);
        arr.extend_from_slice(&[LITERAL_TRUE, 0]);
        arr.push(LITERAL);
        arr.extend_from_slice(&[LITERAL_NULL, 0]);

        let mut doc = vec![SMALL_ARRAY];
        doc.extend_from_slice(&arr);
        assert_eq!(parse_json(&doc).unwrap(), serde_json::json!([true, null]));
    }

    #[test]
    fn test_bad_offset() {
        let mut doc = vec![SMALL_ARRAY];
        doc.extend_from_slice(&1u16.to_le_bytes());
        doc.extend_from_slice(&0u16.to_le_bytes());
        doc.push(STRING);
        doc.extend_from_slice(&500u16.to_le_bytes());
        assert!(matches!(parse_json(&doc), Err(DecodeError::Malformed(_))));
    }
}
