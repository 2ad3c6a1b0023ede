//! Column value decoding for rows events.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use rowtide_core::Value;

use super::event::column_type as ct;
use super::json::parse_json;
use crate::error::{DecodeError, DecodeResult};

/// Decode one non-null column value.
pub fn read_value(cursor: &mut Cursor<&[u8]>, col_type: u8, meta: u16) -> DecodeResult<Value> {
    let value = match col_type {
        ct::NULL => Value::Null,
        ct::TINY => Value::Int(i64::from(cursor.read_i8()?)),
        ct::SHORT => Value::Int(i64::from(cursor.read_i16::<LittleEndian>()?)),
        ct::INT24 => Value::Int(i64::from(cursor.read_i24::<LittleEndian>()?)),
        ct::LONG => Value::Int(i64::from(cursor.read_i32::<LittleEndian>()?)),
        ct::LONGLONG => Value::Int(cursor.read_i64::<LittleEndian>()?),
        ct::FLOAT => Value::Float(widen_f32(cursor.read_f32::<LittleEndian>()?)),
        ct::DOUBLE => Value::Float(cursor.read_f64::<LittleEndian>()?),
        ct::NEWDECIMAL => {
            let precision = (meta >> 8) as u8;
            let scale = (meta & 0xFF) as u8;
            Value::Decimal(read_decimal(cursor, precision, scale)?)
        }
        ct::YEAR => match cursor.read_u8()? {
            0 => Value::Int(0),
            y => Value::Int(1900 + i64::from(y)),
        },
        ct::DATE => Value::String(format_date(cursor.read_u24::<LittleEndian>()?)),
        ct::TIME => Value::String(format_time(cursor.read_u24::<LittleEndian>()?)),
        ct::TIME2 => Value::String(read_time2(cursor, meta)?),
        ct::DATETIME => Value::String(format_datetime(cursor.read_u64::<LittleEndian>()?)),
        ct::DATETIME2 => Value::String(read_datetime2(cursor, meta)?),
        ct::TIMESTAMP => Value::String(format_timestamp(cursor.read_u32::<LittleEndian>()?, 0, 0)),
        ct::TIMESTAMP2 => {
            let secs = cursor.read_u32::<BigEndian>()?;
            let usec = read_fraction(cursor, meta)?;
            Value::String(format_timestamp(secs, usec, meta))
        }
        ct::VARCHAR | ct::VAR_STRING => {
            let len = if meta < 256 {
                usize::from(cursor.read_u8()?)
            } else {
                usize::from(cursor.read_u16::<LittleEndian>()?)
            };
            Value::Bytes(read_bytes(cursor, len)?)
        }
        ct::STRING => read_string_column(cursor, meta)?,
        ct::ENUM => read_enum(cursor, meta & 0xFF)?,
        ct::SET => Value::UInt(read_uint_le(cursor, usize::from(meta & 0xFF))?),
        ct::BIT => {
            let bits = (meta >> 8) * 8 + (meta & 0xFF);
            let len = usize::from(bits).div_ceil(8);
            Value::UInt(read_uint_be(cursor, len)?)
        }
        ct::BLOB | ct::TINY_BLOB | ct::MEDIUM_BLOB | ct::LONG_BLOB | ct::GEOMETRY => {
            let len = read_uint_le(cursor, usize::from(meta))? as usize;
            Value::Bytes(read_bytes(cursor, len)?)
        }
        ct::JSON => {
            let len = read_uint_le(cursor, usize::from(meta))? as usize;
            let data = read_bytes(cursor, len)?;
            Value::Json(parse_json(&data)?)
        }
        other => return Err(DecodeError::UnsupportedColumn(other)),
    };

    Ok(value)
}

/// CHAR, BINARY, ENUM and SET all arrive as STRING with the real type packed
/// into the metadata.
fn read_string_column(cursor: &mut Cursor<&[u8]>, meta: u16) -> DecodeResult<Value> {
    let (real_type, length) = if meta >= 256 {
        let b0 = (meta >> 8) as u8;
        let b1 = (meta & 0xFF) as u8;
        if b0 & 0x30 != 0x30 {
            let length = u16::from(b1) | (u16::from((b0 & 0x30) ^ 0x30) << 4);
            (b0 | 0x30, length)
        } else {
            (b0, u16::from(b1))
        }
    } else {
        (ct::STRING, meta)
    };

    match real_type {
        ct::ENUM => read_enum(cursor, length),
        ct::SET => Ok(Value::UInt(read_uint_le(cursor, usize::from(length))?)),
        _ => {
            let len = if length < 256 {
                usize::from(cursor.read_u8()?)
            } else {
                usize::from(cursor.read_u16::<LittleEndian>()?)
            };
            Ok(Value::Bytes(read_bytes(cursor, len)?))
        }
    }
}

fn read_enum(cursor: &mut Cursor<&[u8]>, size: u16) -> DecodeResult<Value> {
    match size {
        1 => Ok(Value::Int(i64::from(cursor.read_u8()?))),
        2 => Ok(Value::Int(i64::from(cursor.read_u16::<LittleEndian>()?))),
        n => Err(DecodeError::Malformed(format!("invalid enum size {n}"))),
    }
}

pub(crate) fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> DecodeResult<Vec<u8>> {
    let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if len as u64 > remaining {
        return Err(DecodeError::Truncated {
            context: "column value",
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("need {len} bytes, {remaining} left"),
            ),
        });
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_uint_le(cursor: &mut Cursor<&[u8]>, len: usize) -> DecodeResult<u64> {
    if len > 8 {
        return Err(DecodeError::Malformed(format!("integer width {len}")));
    }
    let bytes = read_bytes(cursor, len)?;
    Ok(bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn read_uint_be(cursor: &mut Cursor<&[u8]>, len: usize) -> DecodeResult<u64> {
    if len > 8 {
        return Err(DecodeError::Malformed(format!("integer width {len}")));
    }
    let bytes = read_bytes(cursor, len)?;
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

const DIG_PER_DEC: usize = 9;
const COMPRESSED_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Decode a packed NEWDECIMAL into its exact decimal string.
pub fn read_decimal(cursor: &mut Cursor<&[u8]>, precision: u8, scale: u8) -> DecodeResult<String> {
    let precision = usize::from(precision);
    let scale = usize::from(scale);
    let integral = precision.saturating_sub(scale);

    let uncomp_int = integral / DIG_PER_DEC;
    let comp_int = integral % DIG_PER_DEC;
    let uncomp_frac = scale / DIG_PER_DEC;
    let comp_frac = scale % DIG_PER_DEC;

    let size = uncomp_int * 4
        + COMPRESSED_BYTES[comp_int]
        + uncomp_frac * 4
        + COMPRESSED_BYTES[comp_frac];
    let mut buf = read_bytes(cursor, size)?;
    if buf.is_empty() {
        return Ok("0".to_string());
    }

    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        for b in buf.iter_mut() {
            *b = !*b;
        }
    }

    let mut pos = 0;
    let mut int_digits = String::new();
    let lead = COMPRESSED_BYTES[comp_int];
    if lead > 0 {
        int_digits.push_str(&be_uint(&buf[pos..pos + lead]).to_string());
        pos += lead;
    }
    for _ in 0..uncomp_int {
        int_digits.push_str(&format!("{:09}", be_uint(&buf[pos..pos + 4])));
        pos += 4;
    }

    let mut frac_digits = String::new();
    for _ in 0..uncomp_frac {
        frac_digits.push_str(&format!("{:09}", be_uint(&buf[pos..pos + 4])));
        pos += 4;
    }
    let trail = COMPRESSED_BYTES[comp_frac];
    if trail > 0 {
        let v = be_uint(&buf[pos..pos + trail]);
        frac_digits.push_str(&format!("{:0width$}", v, width = comp_frac));
    }

    let int_digits = match int_digits.trim_start_matches('0') {
        "" => "0",
        digits => digits,
    };

    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }
    out.push_str(int_digits);
    if scale > 0 {
        out.push('.');
        out.push_str(&frac_digits);
    }
    Ok(out)
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Fractional seconds in microseconds for a column with `fsp` digits.
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u16) -> DecodeResult<u32> {
    let usec = match fsp {
        0 => 0,
        1 | 2 => u32::from(cursor.read_u8()?) * 10_000,
        3 | 4 => u32::from(cursor.read_u16::<BigEndian>()?) * 100,
        5 | 6 => cursor.read_u24::<BigEndian>()?,
        n => return Err(DecodeError::Malformed(format!("invalid fsp {n}"))),
    };
    Ok(usec)
}

fn fraction_suffix(usec: u32, fsp: u16) -> String {
    if fsp == 0 {
        return String::new();
    }
    let digits = format!("{usec:06}");
    format!(".{}", &digits[..usize::from(fsp.min(6))])
}

fn format_date(v: u32) -> String {
    if v == 0 {
        return "0000-00-00".to_string();
    }
    let day = v & 31;
    let month = (v >> 5) & 15;
    let year = v >> 9;
    format!("{year:04}-{month:02}-{day:02}")
}

fn format_time(v: u32) -> String {
    if v == 0 {
        return "00:00:00".to_string();
    }
    format!("{:02}:{:02}:{:02}", v / 10_000, (v % 10_000) / 100, v % 100)
}

fn format_datetime(v: u64) -> String {
    if v == 0 {
        return "0000-00-00 00:00:00".to_string();
    }
    let d = v / 1_000_000;
    let t = v % 1_000_000;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        d / 10_000,
        (d % 10_000) / 100,
        d % 100,
        t / 10_000,
        (t % 10_000) / 100,
        t % 100
    )
}

/// Widen through the shortest decimal form, so `0.1f32` becomes `0.1`.
fn widen_f32(v: f32) -> f64 {
    v.to_string().parse().unwrap_or_else(|_| f64::from(v))
}

fn format_timestamp(secs: u32, usec: u32, fsp: u16) -> String {
    if secs == 0 {
        return format!("0000-00-00 00:00:00{}", fraction_suffix(0, fsp));
    }
    match chrono::DateTime::from_timestamp(i64::from(secs), 0) {
        Some(dt) => format!(
            "{}{}",
            dt.format("%Y-%m-%d %H:%M:%S"),
            fraction_suffix(usec, fsp)
        ),
        None => secs.to_string(),
    }
}

const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;
const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;

fn read_datetime2(cursor: &mut Cursor<&[u8]>, fsp: u16) -> DecodeResult<String> {
    let packed = read_uint_be(cursor, 5)? as i64 - DATETIMEF_INT_OFS;
    let usec = read_fraction(cursor, fsp)?;

    if packed == 0 {
        return Ok(format!("0000-00-00 00:00:00{}", fraction_suffix(0, fsp)));
    }

    let ymdhms = packed.abs();
    let ymd = ymdhms >> 17;
    let ym = ymd >> 5;
    let hms = ymdhms % (1 << 17);

    let day = ymd % (1 << 5);
    let month = ym % 13;
    let year = ym / 13;
    let second = hms % (1 << 6);
    let minute = (hms >> 6) % (1 << 6);
    let hour = hms >> 12;

    Ok(format!(
        "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}{}",
        fraction_suffix(usec, fsp)
    ))
}

fn read_time2(cursor: &mut Cursor<&[u8]>, fsp: u16) -> DecodeResult<String> {
    let (int_part, tmp) = match fsp {
        1 | 2 => {
            let mut int_part = read_uint_be(cursor, 3)? as i64 - TIMEF_INT_OFS;
            let mut frac = i64::from(cursor.read_u8()?);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part, (int_part << 24) + frac * 10_000)
        }
        3 | 4 => {
            let mut int_part = read_uint_be(cursor, 3)? as i64 - TIMEF_INT_OFS;
            let mut frac = i64::from(cursor.read_u16::<BigEndian>()?);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part, (int_part << 24) + frac * 100)
        }
        5 | 6 => {
            let tmp = read_uint_be(cursor, 6)? as i64 - TIMEF_OFS;
            (tmp >> 24, tmp)
        }
        _ => {
            let int_part = read_uint_be(cursor, 3)? as i64 - TIMEF_INT_OFS;
            (int_part, int_part << 24)
        }
    };

    if int_part == 0 && tmp == 0 {
        return Ok(format!("00:00:00{}", fraction_suffix(0, fsp)));
    }

    let sign = if tmp < 0 { "-" } else { "" };
    let tmp = tmp.abs();
    let hms = tmp >> 24;
    let hour = (hms >> 12) % (1 << 10);
    let minute = (hms >> 6) % (1 << 6);
    let second = hms % (1 << 6);
    let usec = (tmp % (1 << 24)) as u32;

    Ok(format!(
        "{sign}{hour:02}:{minute:02}:{second:02}{}",
        fraction_suffix(usec, fsp)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(col_type: u8, meta: u16, bytes: &[u8]) -> Value {
        let mut cursor = Cursor::new(bytes);
        let value = read_value(&mut cursor, col_type, meta).unwrap();
        assert_eq!(cursor.position() as usize, bytes.len(), "bytes left over");
        value
    }

    #[test]
    fn test_integers() {
        assert_eq!(decode(ct::TINY, 0, &[0xFF]), Value::Int(-1));
        assert_eq!(decode(ct::SHORT, 0, &300i16.to_le_bytes()), Value::Int(300));
        assert_eq!(decode(ct::INT24, 0, &[0xFF, 0xFF, 0xFF]), Value::Int(-1));
        assert_eq!(decode(ct::LONG, 0, &(-7i32).to_le_bytes()), Value::Int(-7));
        assert_eq!(
            decode(ct::LONGLONG, 0, &i64::MAX.to_le_bytes()),
            Value::Int(i64::MAX)
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(decode(ct::FLOAT, 4, &1.5f32.to_le_bytes()), Value::Float(1.5));
        assert_eq!(decode(ct::FLOAT, 4, &0.1f32.to_le_bytes()), Value::Float(0.1));
        assert_eq!(
            decode(ct::FLOAT, 4, &(-3.3f32).to_le_bytes()),
            Value::Float(-3.3)
        );
        assert_eq!(decode(ct::DOUBLE, 8, &2.25f64.to_le_bytes()), Value::Float(2.25));
    }

    #[test]
    fn test_varchar_short_and_long() {
        assert_eq!(
            decode(ct::VARCHAR, 255, &[3, b'a', b'b', b'c']),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(
            decode(ct::VARCHAR, 1024, &[2, 0, b'h', b'i']),
            Value::Bytes(b"hi".to_vec())
        );
    }

    #[test]
    fn test_string_enum_and_set() {
        // CHAR(10): real type STRING, length 10
        let meta = (u16::from(ct::STRING) << 8) | 10;
        assert_eq!(decode(ct::STRING, meta, &[2, b'o', b'k']), Value::Bytes(b"ok".to_vec()));

        let meta = (u16::from(ct::ENUM) << 8) | 1;
        assert_eq!(decode(ct::STRING, meta, &[2]), Value::Int(2));

        let meta = (u16::from(ct::SET) << 8) | 1;
        assert_eq!(decode(ct::STRING, meta, &[0b101]), Value::UInt(5));
    }

    #[test]
    fn test_blob() {
        assert_eq!(
            decode(ct::BLOB, 2, &[3, 0, 1, 2, 3]),
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_bit() {
        // BIT(10): 1 full byte + 2 bits
        assert_eq!(decode(ct::BIT, (1 << 8) | 2, &[0x02, 0x01]), Value::UInt(0x0201));
    }

    #[test]
    fn test_decimal() {
        // DECIMAL(5,2) 123.45
        assert_eq!(
            decode(ct::NEWDECIMAL, (5 << 8) | 2, &[0x80, 0x7B, 0x2D]),
            Value::Decimal("123.45".into())
        );
        // DECIMAL(5,2) -123.45
        assert_eq!(
            decode(ct::NEWDECIMAL, (5 << 8) | 2, &[0x7F, 0x84, 0xD2]),
            Value::Decimal("-123.45".into())
        );
        // DECIMAL(10,0) 1
        assert_eq!(
            decode(ct::NEWDECIMAL, 10 << 8, &[0x80, 0x00, 0x00, 0x00, 0x01]),
            Value::Decimal("1".into())
        );
    }

    #[test]
    fn test_date_and_year() {
        let packed: u32 = (2024 << 9) | (2 << 5) | 29;
        assert_eq!(
            decode(ct::DATE, 0, &packed.to_le_bytes()[..3]),
            Value::String("2024-02-29".into())
        );
        assert_eq!(decode(ct::YEAR, 0, &[124]), Value::Int(2024));
    }

    #[test]
    fn test_datetime2() {
        // 2024-02-29 13:45:30 without fractional seconds
        let ym: i64 = 2024 * 13 + 2;
        let ymd = (ym << 5) | 29;
        let hms: i64 = (13 << 12) | (45 << 6) | 30;
        let packed = ((ymd << 17) | hms) + DATETIMEF_INT_OFS;
        let bytes = &packed.to_be_bytes()[3..];
        assert_eq!(
            decode(ct::DATETIME2, 0, bytes),
            Value::String("2024-02-29 13:45:30".into())
        );

        // same instant with fsp=3 and .250
        let mut bytes = bytes.to_vec();
        bytes.extend_from_slice(&2500u16.to_be_bytes());
        assert_eq!(
            decode(ct::DATETIME2, 3, &bytes),
            Value::String("2024-02-29 13:45:30.250".into())
        );
    }

    #[test]
    fn test_timestamp2() {
        let mut bytes = 1_700_000_000u32.to_be_bytes().to_vec();
        assert_eq!(
            decode(ct::TIMESTAMP2, 0, &bytes),
            Value::String("2023-11-14 22:13:20".into())
        );
        bytes.extend_from_slice(&[0x01, 0xE2, 0x40]);
        assert_eq!(
            decode(ct::TIMESTAMP2, 6, &bytes),
            Value::String("2023-11-14 22:13:20.123456".into())
        );
    }

    #[test]
    fn test_time2() {
        let hms: i64 = (12 << 12) | (34 << 6) | 56;
        let packed = hms + TIMEF_INT_OFS;
        assert_eq!(
            decode(ct::TIME2, 0, &packed.to_be_bytes()[5..]),
            Value::String("12:34:56".into())
        );
    }

    #[test]
    fn test_truncated_value() {
        let mut cursor = Cursor::new(&[5u8, b'a'][..]);
        let err = read_value(&mut cursor, ct::VARCHAR, 100).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_unsupported_column_type() {
        let mut cursor = Cursor::new(&[0u8][..]);
        assert!(matches!(
            read_value(&mut cursor, ct::DECIMAL, 0),
            Err(DecodeError::UnsupportedColumn(0))
        ));
    }
}
