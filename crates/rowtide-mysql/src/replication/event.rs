//! Typed binlog events.

use rowtide_core::Value;

pub const EVENT_HEADER_LEN: usize = 19;

/// Set on events that may be skipped by readers that do not understand them.
pub const LOG_EVENT_IGNORABLE_F: u16 = 0x80;
/// Set on events generated by the dump thread rather than read from a file.
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;

pub const BINLOG_CHECKSUM_ALG_OFF: u8 = 0;
pub const BINLOG_CHECKSUM_ALG_CRC32: u8 = 1;
pub const BINLOG_CHECKSUM_LEN: usize = 4;

/// Binlog event type codes.
pub mod event_type {
    pub const QUERY: u8 = 2;
    pub const STOP: u8 = 3;
    pub const ROTATE: u8 = 4;
    pub const INTVAR: u8 = 5;
    pub const RAND: u8 = 13;
    pub const USER_VAR: u8 = 14;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const INCIDENT: u8 = 26;
    pub const HEARTBEAT: u8 = 27;
    pub const IGNORABLE: u8 = 28;
    pub const ROWS_QUERY: u8 = 29;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
    pub const GTID: u8 = 33;
    pub const ANONYMOUS_GTID: u8 = 34;
    pub const PREVIOUS_GTIDS: u8 = 35;
    pub const HEARTBEAT_V2: u8 = 41;
}

/// Column type codes as they appear in table map events.
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// The fixed 19-byte header in front of every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_size: u32,
    /// Position of the next event in the current binlog file.
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// A decoded event together with its header.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub header: EventHeader,
    pub body: BinlogEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    Gtid(GtidEvent),
    Heartbeat(HeartbeatEvent),
    /// Understood but carries nothing the engine acts on.
    Ignored(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub checksum_alg: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub position: u64,
    pub next_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidEvent {
    pub xid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidEvent {
    pub commit_flag: bool,
    pub sid: [u8; 16],
    pub gno: u64,
}

impl GtidEvent {
    /// `uuid:gno` as printed by the server.
    pub fn gtid(&self) -> String {
        format!("{}:{}", uuid::Uuid::from_bytes(self.sid), self.gno)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub log_file: String,
}

/// Column layout of a table, sent before the rows events that use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<u8>,
    /// Per-column type metadata (length, precision, fsp, ...).
    pub column_meta: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Row images of one rows event, with values in table-map column order.
///
/// Columns absent from the event's present-bitmap are `Value::Null`. Update
/// events alternate before and after images.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    pub rows: Vec<Vec<Value>>,
}
