//! Turns raw event bytes into typed [`LogEvent`]s.
//!
//! The decoder carries the state the binlog format needs between events:
//! the active format description (which decides whether events end in a
//! checksum) and the table maps that rows events refer to by id.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use rowtide_core::Value;
use tracing::debug;

use super::event::{
    event_type as et, column_type as ct, BinlogEvent, EventHeader, FormatDescriptionEvent,
    GtidEvent, HeartbeatEvent, LogEvent, QueryEvent, RotateEvent, RowsEvent, RowsKind,
    TableMapEvent, XidEvent, BINLOG_CHECKSUM_ALG_CRC32, BINLOG_CHECKSUM_ALG_OFF,
    BINLOG_CHECKSUM_LEN, EVENT_HEADER_LEN, LOG_EVENT_IGNORABLE_F,
};
use super::value::{read_bytes, read_value};
use crate::error::{DecodeError, DecodeResult};

const SERVER_VERSION_LEN: usize = 50;

/// Event types that are read and dropped.
const IGNORED_TYPES: &[u8] = &[
    et::STOP,
    et::INTVAR,
    et::RAND,
    et::USER_VAR,
    et::INCIDENT,
    et::IGNORABLE,
    et::ROWS_QUERY,
    et::ANONYMOUS_GTID,
    et::PREVIOUS_GTIDS,
    // MariaDB annotate rows, binlog checkpoint, GTID and GTID list
    160,
    161,
    162,
    163,
];

#[derive(Debug, Default)]
pub struct BinlogDecoder {
    format: Option<FormatDescriptionEvent>,
    table_maps: HashMap<u64, TableMapEvent>,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum algorithm announced by the last format description.
    pub fn checksum_alg(&self) -> u8 {
        self.format
            .as_ref()
            .map(|f| f.checksum_alg)
            .unwrap_or(BINLOG_CHECKSUM_ALG_OFF)
    }

    pub fn format(&self) -> Option<&FormatDescriptionEvent> {
        self.format.as_ref()
    }

    pub fn table_map(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_maps.get(&table_id)
    }

    /// Forget all stream state, e.g. before reading from a new connection.
    pub fn reset(&mut self) {
        self.format = None;
        self.table_maps.clear();
    }

    /// Decode one event (header included).
    pub fn decode(&mut self, data: &[u8]) -> DecodeResult<LogEvent> {
        let header = in_context("event header", decode_header(data))?;
        if header.event_size as usize != data.len() {
            return Err(DecodeError::Malformed(format!(
                "event size {} does not match {} received bytes",
                header.event_size,
                data.len()
            )));
        }

        let body = &data[EVENT_HEADER_LEN..];

        if header.event_type == et::FORMAT_DESCRIPTION {
            let fde = in_context("format description event", decode_format_description(body))?;
            debug!(
                server_version = %fde.server_version,
                checksum_alg = fde.checksum_alg,
                "format description"
            );
            // A new format description starts a new file; table ids are reassigned.
            self.table_maps.clear();
            self.format = Some(fde.clone());
            return Ok(LogEvent {
                header,
                body: BinlogEvent::FormatDescription(fde),
            });
        }

        let body = if self.checksum_alg() == BINLOG_CHECKSUM_ALG_CRC32 {
            body.get(..body.len().saturating_sub(BINLOG_CHECKSUM_LEN))
                .unwrap_or_default()
        } else {
            body
        };

        let event = match header.event_type {
            et::ROTATE => BinlogEvent::Rotate(in_context("rotate event", decode_rotate(body))?),
            et::QUERY => BinlogEvent::Query(in_context("query event", decode_query(body))?),
            et::XID => BinlogEvent::Xid(in_context("xid event", decode_xid(body))?),
            et::GTID => BinlogEvent::Gtid(in_context("gtid event", decode_gtid(body))?),
            et::HEARTBEAT => BinlogEvent::Heartbeat(HeartbeatEvent {
                log_file: String::from_utf8_lossy(body).into_owned(),
            }),
            et::HEARTBEAT_V2 => {
                BinlogEvent::Heartbeat(in_context("heartbeat event", decode_heartbeat_v2(body))?)
            }
            et::TABLE_MAP => {
                let map = in_context("table map event", decode_table_map(body))?;
                self.table_maps.insert(map.table_id, map.clone());
                BinlogEvent::TableMap(map)
            }
            t @ (et::WRITE_ROWS_V1
            | et::UPDATE_ROWS_V1
            | et::DELETE_ROWS_V1
            | et::WRITE_ROWS_V2
            | et::UPDATE_ROWS_V2
            | et::DELETE_ROWS_V2) => {
                BinlogEvent::Rows(in_context("rows event", self.decode_rows(t, body))?)
            }
            t if IGNORED_TYPES.contains(&t) => BinlogEvent::Ignored(t),
            t if header.flags & LOG_EVENT_IGNORABLE_F != 0 => BinlogEvent::Ignored(t),
            t => return Err(DecodeError::Unsupported(t)),
        };

        Ok(LogEvent {
            header,
            body: event,
        })
    }

    fn decode_rows(&self, event_type: u8, body: &[u8]) -> DecodeResult<RowsEvent> {
        let (kind, v2) = match event_type {
            et::WRITE_ROWS_V1 => (RowsKind::Write, false),
            et::UPDATE_ROWS_V1 => (RowsKind::Update, false),
            et::DELETE_ROWS_V1 => (RowsKind::Delete, false),
            et::WRITE_ROWS_V2 => (RowsKind::Write, true),
            et::UPDATE_ROWS_V2 => (RowsKind::Update, true),
            _ => (RowsKind::Delete, true),
        };

        let mut c = Cursor::new(body);
        let table_id = c.read_u48::<LittleEndian>()?;
        let flags = c.read_u16::<LittleEndian>()?;

        if v2 {
            let extra_len = c.read_u16::<LittleEndian>()?;
            read_bytes(&mut c, usize::from(extra_len.saturating_sub(2)))?;
        }

        let column_count = read_packed_int(&mut c)? as usize;
        let bitmap_len = column_count.div_ceil(8);
        let present = read_bytes(&mut c, bitmap_len)?;
        let present_after = if kind == RowsKind::Update {
            read_bytes(&mut c, bitmap_len)?
        } else {
            present.clone()
        };

        let map = self
            .table_maps
            .get(&table_id)
            .ok_or(DecodeError::MissingTableMap(table_id))?;
        if map.column_count() != column_count {
            return Err(DecodeError::Malformed(format!(
                "rows event for {}.{} has {column_count} columns, table map has {}",
                map.schema,
                map.table,
                map.column_count()
            )));
        }

        let mut rows = Vec::new();
        while (c.position() as usize) < body.len() {
            rows.push(read_row(&mut c, map, &present)?);
            if kind == RowsKind::Update {
                rows.push(read_row(&mut c, map, &present_after)?);
            }
        }

        Ok(RowsEvent {
            kind,
            table_id,
            flags,
            column_count,
            rows,
        })
    }
}

/// Re-label truncation errors with the event being decoded.
fn in_context<T>(context: &'static str, result: DecodeResult<T>) -> DecodeResult<T> {
    result.map_err(|e| match e {
        DecodeError::Truncated { source, .. } => DecodeError::Truncated { context, source },
        other => other,
    })
}

fn bit_set(bitmap: &[u8], i: usize) -> bool {
    bitmap
        .get(i / 8)
        .map(|b| b & (1 << (i % 8)) != 0)
        .unwrap_or(false)
}

pub fn decode_header(data: &[u8]) -> DecodeResult<EventHeader> {
    let mut c = Cursor::new(data);
    Ok(EventHeader {
        timestamp: c.read_u32::<LittleEndian>()?,
        event_type: c.read_u8()?,
        server_id: c.read_u32::<LittleEndian>()?,
        event_size: c.read_u32::<LittleEndian>()?,
        log_pos: c.read_u32::<LittleEndian>()?,
        flags: c.read_u16::<LittleEndian>()?,
    })
}

/// Length-encoded integer as used throughout the client protocol.
pub fn read_packed_int(c: &mut Cursor<&[u8]>) -> DecodeResult<u64> {
    match c.read_u8()? {
        n @ 0..=250 => Ok(u64::from(n)),
        252 => Ok(u64::from(c.read_u16::<LittleEndian>()?)),
        253 => Ok(u64::from(c.read_u24::<LittleEndian>()?)),
        254 => Ok(c.read_u64::<LittleEndian>()?),
        n => Err(DecodeError::Malformed(format!(
            "invalid length-encoded integer prefix 0x{n:02X}"
        ))),
    }
}

fn read_string(c: &mut Cursor<&[u8]>, len: usize) -> DecodeResult<String> {
    Ok(String::from_utf8_lossy(&read_bytes(c, len)?).into_owned())
}

fn rest<'a>(c: &Cursor<&'a [u8]>) -> &'a [u8] {
    let data: &'a [u8] = *c.get_ref();
    data.get(c.position() as usize..).unwrap_or_default()
}

/// Versions from 5.6.1 on append a checksum algorithm byte to the FDE.
fn version_has_checksum(version: &str) -> bool {
    let numeric: String = version
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major, minor, patch) >= (5, 6, 1)
}

fn decode_format_description(body: &[u8]) -> DecodeResult<FormatDescriptionEvent> {
    let mut c = Cursor::new(body);
    let binlog_version = c.read_u16::<LittleEndian>()?;
    let raw_version = read_bytes(&mut c, SERVER_VERSION_LEN)?;
    let server_version = String::from_utf8_lossy(&raw_version)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = c.read_u32::<LittleEndian>()?;
    let header_length = c.read_u8()?;

    let checksum_alg = if version_has_checksum(&server_version) {
        // alg byte, then the 4-byte checksum of the FDE itself
        let at = body
            .len()
            .checked_sub(BINLOG_CHECKSUM_LEN + 1)
            .ok_or_else(|| DecodeError::Malformed("format description too short".into()))?;
        body[at]
    } else {
        BINLOG_CHECKSUM_ALG_OFF
    };

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        checksum_alg,
    })
}

fn decode_rotate(body: &[u8]) -> DecodeResult<RotateEvent> {
    let mut c = Cursor::new(body);
    let position = c.read_u64::<LittleEndian>()?;
    let next_file = String::from_utf8_lossy(rest(&c)).into_owned();
    Ok(RotateEvent {
        position,
        next_file,
    })
}

fn decode_query(body: &[u8]) -> DecodeResult<QueryEvent> {
    let mut c = Cursor::new(body);
    let thread_id = c.read_u32::<LittleEndian>()?;
    let exec_time = c.read_u32::<LittleEndian>()?;
    let schema_len = usize::from(c.read_u8()?);
    let error_code = c.read_u16::<LittleEndian>()?;
    let status_len = usize::from(c.read_u16::<LittleEndian>()?);
    read_bytes(&mut c, status_len)?;
    let schema = read_string(&mut c, schema_len)?;
    c.read_u8()?;
    let query = String::from_utf8_lossy(rest(&c)).into_owned();

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        query,
    })
}

fn decode_xid(body: &[u8]) -> DecodeResult<XidEvent> {
    let mut c = Cursor::new(body);
    Ok(XidEvent {
        xid: c.read_u64::<LittleEndian>()?,
    })
}

fn decode_gtid(body: &[u8]) -> DecodeResult<GtidEvent> {
    let mut c = Cursor::new(body);
    let commit_flag = c.read_u8()? != 0;
    let mut sid = [0u8; 16];
    c.read_exact(&mut sid)?;
    let gno = c.read_u64::<LittleEndian>()?;
    Ok(GtidEvent {
        commit_flag,
        sid,
        gno,
    })
}

/// Heartbeat v2 carries `type, length, value` fields; type 0 is the log name.
fn decode_heartbeat_v2(body: &[u8]) -> DecodeResult<HeartbeatEvent> {
    let mut c = Cursor::new(body);
    let mut log_file = String::new();
    while (c.position() as usize) < body.len() {
        let field = c.read_u8()?;
        let len = read_packed_int(&mut c)? as usize;
        let value = read_bytes(&mut c, len)?;
        if field == 0 {
            log_file = String::from_utf8_lossy(&value).into_owned();
        }
    }
    Ok(HeartbeatEvent { log_file })
}

fn decode_table_map(body: &[u8]) -> DecodeResult<TableMapEvent> {
    let mut c = Cursor::new(body);
    let table_id = c.read_u48::<LittleEndian>()?;
    let flags = c.read_u16::<LittleEndian>()?;

    let schema_len = usize::from(c.read_u8()?);
    let schema = read_string(&mut c, schema_len)?;
    c.read_u8()?;
    let table_len = usize::from(c.read_u8()?);
    let table = read_string(&mut c, table_len)?;
    c.read_u8()?;

    let column_count = read_packed_int(&mut c)? as usize;
    let column_types = read_bytes(&mut c, column_count)?;

    let meta_len = read_packed_int(&mut c)? as usize;
    let meta = read_bytes(&mut c, meta_len)?;
    let column_meta = decode_column_meta(&column_types, &meta)?;

    let null_bitmap = read_bytes(&mut c, column_count.div_ceil(8))?;

    Ok(TableMapEvent {
        table_id,
        flags,
        schema,
        table,
        column_types,
        column_meta,
        null_bitmap,
    })
}

fn decode_column_meta(types: &[u8], meta: &[u8]) -> DecodeResult<Vec<u16>> {
    let mut c = Cursor::new(meta);
    types
        .iter()
        .map(|&t| {
            let value = match t {
                // real type and length, big-endian
                ct::STRING | ct::SET | ct::ENUM => {
                    let hi = u16::from(c.read_u8()?);
                    let lo = u16::from(c.read_u8()?);
                    (hi << 8) | lo
                }
                // precision, scale
                ct::NEWDECIMAL => {
                    let precision = u16::from(c.read_u8()?);
                    let scale = u16::from(c.read_u8()?);
                    (precision << 8) | scale
                }
                ct::VARCHAR | ct::VAR_STRING | ct::BIT => c.read_u16::<LittleEndian>()?,
                ct::BLOB
                | ct::TINY_BLOB
                | ct::MEDIUM_BLOB
                | ct::LONG_BLOB
                | ct::DOUBLE
                | ct::FLOAT
                | ct::GEOMETRY
                | ct::JSON
                | ct::TIME2
                | ct::DATETIME2
                | ct::TIMESTAMP2 => u16::from(c.read_u8()?),
                _ => 0,
            };
            Ok::<u16, DecodeError>(value)
        })
        .collect()
}

fn read_row(
    c: &mut Cursor<&[u8]>,
    map: &TableMapEvent,
    present: &[u8],
) -> DecodeResult<Vec<Value>> {
    let column_count = map.column_count();
    let present_count = (0..column_count).filter(|&i| bit_set(present, i)).count();
    let null_bitmap = read_bytes(c, present_count.div_ceil(8))?;

    let mut row = Vec::with_capacity(column_count);
    let mut present_index = 0;
    for i in 0..column_count {
        if !bit_set(present, i) {
            row.push(Value::Null);
            continue;
        }

        let is_null = bit_set(&null_bitmap, present_index);
        present_index += 1;
        if is_null {
            row.push(Value::Null);
            continue;
        }

        row.push(read_value(c, map.column_types[i], map.column_meta[i])?);
    }

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::BinlogWriter;

    fn decoder_with_fde(alg: u8) -> BinlogDecoder {
        let mut decoder = BinlogDecoder::new();
        let fde = BinlogWriter::new().with_checksum(alg).format_description();
        decoder.decode(&fde).unwrap();
        decoder
    }

    #[test]
    fn test_format_description() {
        let mut decoder = BinlogDecoder::new();
        let event = decoder
            .decode(&BinlogWriter::new().format_description())
            .unwrap();
        match event.body {
            BinlogEvent::FormatDescription(fde) => {
                assert_eq!(fde.binlog_version, 4);
                assert_eq!(fde.server_version, "8.0.36");
                assert_eq!(fde.checksum_alg, BINLOG_CHECKSUM_ALG_OFF);
            }
            other => panic!("expected format description, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_is_stripped() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_CRC32);
        assert_eq!(decoder.checksum_alg(), BINLOG_CHECKSUM_ALG_CRC32);

        let writer = BinlogWriter::new().with_checksum(BINLOG_CHECKSUM_ALG_CRC32);
        let event = decoder.decode(&writer.xid(42, 500)).unwrap();
        assert_eq!(event.body, BinlogEvent::Xid(XidEvent { xid: 42 }));
        assert_eq!(event.header.log_pos, 500);
    }

    #[test]
    fn test_rotate_and_query() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();

        let event = decoder.decode(&writer.rotate("mysql-bin.000002", 4)).unwrap();
        assert_eq!(
            event.body,
            BinlogEvent::Rotate(RotateEvent {
                position: 4,
                next_file: "mysql-bin.000002".to_string(),
            })
        );

        let event = decoder
            .decode(&writer.query("test", "ALTER TABLE t ADD COLUMN c INT", 900))
            .unwrap();
        match event.body {
            BinlogEvent::Query(q) => {
                assert_eq!(q.schema, "test");
                assert_eq!(q.query, "ALTER TABLE t ADD COLUMN c INT");
            }
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn test_rows_event_uses_table_map() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();

        decoder
            .decode(&writer.table_map(7, "test", "t", &[ct::LONG, ct::VARCHAR], &[0, 255], 300))
            .unwrap();
        let event = decoder
            .decode(&writer.write_rows(
                7,
                &[ct::LONG, ct::VARCHAR],
                &[vec![Value::Int(1), Value::Bytes(b"a".to_vec())]],
                400,
            ))
            .unwrap();

        match event.body {
            BinlogEvent::Rows(rows) => {
                assert_eq!(rows.kind, RowsKind::Write);
                assert_eq!(rows.table_id, 7);
                assert_eq!(
                    rows.rows,
                    vec![vec![Value::Int(1), Value::Bytes(b"a".to_vec())]]
                );
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn test_update_rows_pairs_images() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();

        decoder
            .decode(&writer.table_map(9, "test", "t", &[ct::LONG, ct::LONG], &[0, 0], 300))
            .unwrap();
        let event = decoder
            .decode(&writer.update_rows(
                9,
                &[ct::LONG, ct::LONG],
                &[
                    vec![Value::Int(1), Value::Null],
                    vec![Value::Int(1), Value::Int(5)],
                ],
                400,
            ))
            .unwrap();

        match event.body {
            BinlogEvent::Rows(rows) => {
                assert_eq!(rows.kind, RowsKind::Update);
                assert_eq!(rows.rows.len(), 2);
                assert_eq!(rows.rows[0], vec![Value::Int(1), Value::Null]);
                assert_eq!(rows.rows[1], vec![Value::Int(1), Value::Int(5)]);
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn test_rows_without_table_map() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();
        let result = decoder.decode(&writer.delete_rows(3, &[ct::LONG], &[vec![Value::Int(1)]], 400));
        assert!(matches!(result, Err(DecodeError::MissingTableMap(3))));
    }

    #[test]
    fn test_format_description_clears_table_maps() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();
        decoder
            .decode(&writer.table_map(7, "test", "t", &[ct::LONG], &[0], 300))
            .unwrap();
        assert!(decoder.table_map(7).is_some());

        decoder.decode(&writer.format_description()).unwrap();
        assert!(decoder.table_map(7).is_none());
    }

    #[test]
    fn test_gtid_and_heartbeat() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();

        let sid = [0x3E, 0x11, 0xFA, 0x47, 0x71, 0xCA, 0x11, 0xE1, 0x9E, 0x33, 0xC8, 0x0A, 0xA9, 0x42, 0x95, 0x62];
        match decoder.decode(&writer.gtid(sid, 23, 200)).unwrap().body {
            BinlogEvent::Gtid(g) => {
                assert_eq!(g.gtid(), "3e11fa47-71ca-11e1-9e33-c80aa9429562:23");
            }
            other => panic!("expected gtid, got {other:?}"),
        }

        let event = decoder.decode(&writer.heartbeat("mysql-bin.000001")).unwrap();
        assert_eq!(
            event.body,
            BinlogEvent::Heartbeat(HeartbeatEvent {
                log_file: "mysql-bin.000001".to_string()
            })
        );
        assert!(event.header.is_artificial());
    }

    #[test]
    fn test_unknown_event_types() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();

        let ignored = decoder.decode(&writer.raw_event(et::PREVIOUS_GTIDS, 0, &[0; 8], 100)).unwrap();
        assert_eq!(ignored.body, BinlogEvent::Ignored(et::PREVIOUS_GTIDS));

        let flagged = decoder
            .decode(&writer.raw_event(99, LOG_EVENT_IGNORABLE_F, &[], 100))
            .unwrap();
        assert_eq!(flagged.body, BinlogEvent::Ignored(99));

        assert!(matches!(
            decoder.decode(&writer.raw_event(99, 0, &[], 100)),
            Err(DecodeError::Unsupported(99))
        ));
    }

    #[test]
    fn test_size_mismatch_and_truncation() {
        let mut decoder = decoder_with_fde(BINLOG_CHECKSUM_ALG_OFF);
        let writer = BinlogWriter::new();

        let mut event = writer.xid(1, 100);
        event.push(0);
        assert!(matches!(decoder.decode(&event), Err(DecodeError::Malformed(_))));

        let short = writer.raw_event(et::XID, 0, &[1, 2], 100);
        match decoder.decode(&short) {
            Err(DecodeError::Truncated { context, .. }) => assert_eq!(context, "xid event"),
            other => panic!("expected truncation, got {other:?}"),
        }

        assert!(matches!(
            decoder.decode(&[1, 2, 3]),
            Err(DecodeError::Truncated { context: "event header", .. })
        ));
    }

    #[test]
    fn test_version_has_checksum() {
        assert!(version_has_checksum("8.0.36"));
        assert!(version_has_checksum("5.6.1-log"));
        assert!(version_has_checksum("10.6.12-MariaDB"));
        assert!(!version_has_checksum("5.5.62"));
        assert!(!version_has_checksum("5.6.0"));
    }
}
