//! In-memory upstream for tests.
//!
//! [`MockUpstream`] serves table metadata from a map, plays back a scripted
//! dump and hands out binlog streams whose events are produced on demand
//! through a [`BinlogFeed`]. [`BinlogWriter`] builds raw event bytes the
//! way a server would send them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rowtide_core::{Position, TableMeta, TableRef, Value};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::error::{CanalError, CanalResult};
use crate::replication::event::{
    column_type as ct, event_type as et, BINLOG_CHECKSUM_ALG_CRC32, BINLOG_CHECKSUM_ALG_OFF,
    BINLOG_CHECKSUM_LEN, EVENT_HEADER_LEN, LOG_EVENT_ARTIFICIAL_F,
};
use crate::source::{DumpHandle, MetadataSource, Upstream};

const STREAM_BUFFER: usize = 64 * 1024;

/// A scripted source database.
#[derive(Clone, Default)]
pub struct MockUpstream {
    state: Arc<Mutex<MockState>>,
    dump_aborted: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    tables: HashMap<TableRef, TableMeta>,
    master: Position,
    master_stalled: bool,
    binlogs: VecDeque<DuplexStream>,
    opened: Vec<Position>,
    dump: Option<DumpScript>,
    dump_failure: Option<String>,
    loads: usize,
}

enum DumpScript {
    Text(String),
    Pipe(DuplexStream),
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, meta: TableMeta) -> Self {
        self.set_table(meta);
        self
    }

    /// Add or replace a table, e.g. to model an `ALTER TABLE`.
    pub fn set_table(&self, meta: TableMeta) {
        self.state.lock().tables.insert(meta.table_ref(), meta);
    }

    pub fn drop_table(&self, schema: &str, table: &str) {
        self.state.lock().tables.remove(&TableRef::new(schema, table));
    }

    pub fn with_master_position(self, position: Position) -> Self {
        self.set_master_position(position);
        self
    }

    pub fn set_master_position(&self, position: Position) {
        self.state.lock().master = position;
    }

    /// Make `master_position` hang, like a server that stopped answering.
    pub fn stall_master_position(&self) {
        self.state.lock().master_stalled = true;
    }

    /// Dump output played back in full when the snapshot starts.
    pub fn with_dump(self, text: impl Into<String>) -> Self {
        self.state.lock().dump = Some(DumpScript::Text(text.into()));
        self
    }

    /// Dump output written by the test; the dump ends when the returned
    /// stream is dropped.
    pub fn dump_pipe(&self) -> DuplexStream {
        let (reader, writer) = tokio::io::duplex(STREAM_BUFFER);
        self.state.lock().dump = Some(DumpScript::Pipe(reader));
        writer
    }

    /// Make the dump exit unsuccessfully after its output is consumed.
    pub fn with_dump_failure(self, stderr: impl Into<String>) -> Self {
        self.state.lock().dump_failure = Some(stderr.into());
        self
    }

    /// Queue a binlog stream for the next `open_binlog` call.
    pub fn binlog_feed(&self, start: Position) -> BinlogFeed {
        let (reader, writer) = tokio::io::duplex(STREAM_BUFFER);
        self.state.lock().binlogs.push_back(reader);
        BinlogFeed::new(writer, start)
    }

    /// Positions `open_binlog` was called with, in order.
    pub fn opened(&self) -> Vec<Position> {
        self.state.lock().opened.clone()
    }

    /// Number of metadata loads served.
    pub fn loads(&self) -> usize {
        self.state.lock().loads
    }

    pub fn dump_aborted(&self) -> bool {
        self.dump_aborted.load(Ordering::SeqCst)
    }
}

impl MetadataSource for MockUpstream {
    async fn load_table(&self, schema: &str, table: &str) -> CanalResult<Option<TableMeta>> {
        let mut state = self.state.lock();
        state.loads += 1;
        Ok(state.tables.get(&TableRef::new(schema, table)).cloned())
    }

    async fn master_position(&self) -> CanalResult<Position> {
        let (master, stalled) = {
            let state = self.state.lock();
            (state.master.clone(), state.master_stalled)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(master)
    }
}

impl Upstream for MockUpstream {
    type Binlog = DuplexStream;
    type Dump = MockDump;

    async fn open_binlog(&self, from: &Position) -> CanalResult<Self::Binlog> {
        let mut state = self.state.lock();
        state.opened.push(from.clone());
        state
            .binlogs
            .pop_front()
            .ok_or_else(|| CanalError::Connection("no binlog stream scripted".into()))
    }

    async fn start_dump(&self) -> CanalResult<Option<Self::Dump>> {
        let (script, failure) = {
            let mut state = self.state.lock();
            (state.dump.take(), state.dump_failure.take())
        };

        let reader = match script {
            None => return Ok(None),
            Some(DumpScript::Pipe(reader)) => reader,
            Some(DumpScript::Text(text)) => {
                let (reader, mut writer) = tokio::io::duplex(STREAM_BUFFER);
                tokio::spawn(async move {
                    let _ = writer.write_all(text.as_bytes()).await;
                });
                reader
            }
        };

        Ok(Some(MockDump {
            output: BufReader::new(reader),
            failure,
            aborted: self.dump_aborted.clone(),
        }))
    }
}

pub struct MockDump {
    output: BufReader<DuplexStream>,
    failure: Option<String>,
    aborted: Arc<AtomicBool>,
}

impl DumpHandle for MockDump {
    type Output = BufReader<DuplexStream>;

    fn output(&mut self) -> &mut Self::Output {
        &mut self.output
    }

    async fn wait(&mut self) -> CanalResult<()> {
        match self.failure.take() {
            Some(stderr) => Err(CanalError::Snapshot(format!(
                "mysqldump exited with exit status: 2: {stderr}"
            ))),
            None => Ok(()),
        }
    }

    async fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Writes events into a mock binlog stream, filling in `log_pos` from the
/// running file offset.
#[derive(Clone)]
pub struct BinlogFeed {
    inner: Arc<tokio::sync::Mutex<FeedState>>,
}

struct FeedState {
    stream: DuplexStream,
    writer: BinlogWriter,
    file: String,
    pos: u32,
    seq: u8,
}

impl BinlogFeed {
    fn new(stream: DuplexStream, start: Position) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(FeedState {
                stream,
                writer: BinlogWriter::new(),
                file: start.name,
                pos: start.pos,
                seq: 1,
            })),
        }
    }

    /// Where the next event will be written.
    pub async fn position(&self) -> Position {
        let state = self.inner.lock().await;
        Position::new(&state.file, state.pos)
    }

    /// What the server sends first: an artificial rotate to the requested
    /// position and the format description.
    pub async fn start(&self) -> std::io::Result<()> {
        let mut state = self.inner.lock().await;
        let rotate = state.writer.rotate(&state.file, state.pos);
        let fde = state.writer.format_description();
        state.send_raw(&rotate).await?;
        state.send_raw(&fde).await
    }

    /// Send an event at the current offset and move the offset past it.
    pub async fn send(&self, event: Vec<u8>) -> std::io::Result<Position> {
        let mut state = self.inner.lock().await;
        state.send_at_offset(event).await
    }

    /// Send an event as is, without touching the offset.
    pub async fn send_raw(&self, event: &[u8]) -> std::io::Result<()> {
        self.inner.lock().await.send_raw(event).await
    }

    pub async fn query(&self, schema: &str, query: &str) -> std::io::Result<Position> {
        let event = self.inner.lock().await.writer.query(schema, query, 0);
        self.send(event).await
    }

    pub async fn begin(&self, schema: &str) -> std::io::Result<Position> {
        self.query(schema, "BEGIN").await
    }

    pub async fn xid(&self, xid: u64) -> std::io::Result<Position> {
        let event = self.inner.lock().await.writer.xid(xid, 0);
        self.send(event).await
    }

    pub async fn gtid(&self, sid: [u8; 16], gno: u64) -> std::io::Result<Position> {
        let event = self.inner.lock().await.writer.gtid(sid, gno, 0);
        self.send(event).await
    }

    pub async fn table_map(
        &self,
        table_id: u64,
        schema: &str,
        table: &str,
        types: &[u8],
        meta: &[u16],
    ) -> std::io::Result<Position> {
        let event = self
            .inner
            .lock()
            .await
            .writer
            .table_map(table_id, schema, table, types, meta, 0);
        self.send(event).await
    }

    pub async fn write_rows(
        &self,
        table_id: u64,
        types: &[u8],
        rows: &[Vec<Value>],
    ) -> std::io::Result<Position> {
        let event = self.inner.lock().await.writer.write_rows(table_id, types, rows, 0);
        self.send(event).await
    }

    pub async fn update_rows(
        &self,
        table_id: u64,
        types: &[u8],
        rows: &[Vec<Value>],
    ) -> std::io::Result<Position> {
        let event = self.inner.lock().await.writer.update_rows(table_id, types, rows, 0);
        self.send(event).await
    }

    pub async fn delete_rows(
        &self,
        table_id: u64,
        types: &[u8],
        rows: &[Vec<Value>],
    ) -> std::io::Result<Position> {
        let event = self.inner.lock().await.writer.delete_rows(table_id, types, rows, 0);
        self.send(event).await
    }

    /// One committed transaction inserting `rows`.
    pub async fn insert(
        &self,
        table_id: u64,
        schema: &str,
        table: &str,
        types: &[u8],
        rows: &[Vec<Value>],
        xid: u64,
    ) -> std::io::Result<Position> {
        let meta: Vec<u16> = types.iter().map(|&t| default_meta(t)).collect();
        self.begin(schema).await?;
        self.table_map(table_id, schema, table, types, &meta).await?;
        self.write_rows(table_id, types, rows).await?;
        self.xid(xid).await
    }

    /// End the current file: a rotate event followed by the new file's
    /// format description.
    pub async fn rotate_to(&self, next_file: &str) -> std::io::Result<Position> {
        let mut state = self.inner.lock().await;
        let mut rotate = state.writer.rotate(next_file, 4);
        // a rotate written into the file is not artificial
        rotate[17..19].copy_from_slice(&0u16.to_le_bytes());
        state.send_at_offset(rotate).await?;

        state.file = next_file.to_string();
        state.pos = 4;
        let fde = state.writer.format_description();
        state.send_raw(&fde).await?;
        Ok(Position::new(next_file, 4))
    }

    pub async fn heartbeat(&self) -> std::io::Result<()> {
        let mut state = self.inner.lock().await;
        let event = state.writer.heartbeat(&state.file);
        state.send_raw(&event).await
    }

    /// Send a heartbeat every `period` until the stream closes.
    pub fn heartbeat_every(&self, period: Duration) -> JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if feed.heartbeat().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Send an ERR packet, as the server does before dropping a replica.
    pub async fn error(&self, code: u16, message: &str) -> std::io::Result<()> {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&code.to_le_bytes());
        payload.extend_from_slice(b"#HY000");
        payload.extend_from_slice(message.as_bytes());

        let mut state = self.inner.lock().await;
        let seq = state.next_seq();
        state.stream.write_all(&packet(seq, &payload)).await
    }

    /// Close the stream; the reader sees end of file.
    pub async fn close(&self) -> std::io::Result<()> {
        self.inner.lock().await.stream.shutdown().await
    }
}

impl FeedState {
    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    async fn send_raw(&mut self, event: &[u8]) -> std::io::Result<()> {
        let mut payload = Vec::with_capacity(event.len() + 1);
        payload.push(0x00);
        payload.extend_from_slice(event);
        let seq = self.next_seq();
        self.stream.write_all(&packet(seq, &payload)).await
    }

    async fn send_at_offset(&mut self, mut event: Vec<u8>) -> std::io::Result<Position> {
        let end = self.pos.saturating_add(event.len() as u32);
        event[13..17].copy_from_slice(&end.to_le_bytes());
        self.send_raw(&event).await?;
        self.pos = end;
        Ok(Position::new(&self.file, end))
    }
}

/// Wrap a payload in a protocol packet header.
pub fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&len.to_le_bytes()[..3]);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

/// Builds binlog events byte for byte.
///
/// Row values are encoded from the column type alone, so string columns use
/// a one-byte length (table map metadata below 256) and blobs a two-byte
/// length (metadata 2).
#[derive(Debug, Clone)]
pub struct BinlogWriter {
    checksum_alg: u8,
    server_id: u32,
    timestamp: u32,
}

impl Default for BinlogWriter {
    fn default() -> Self {
        Self {
            checksum_alg: BINLOG_CHECKSUM_ALG_OFF,
            server_id: 1,
            timestamp: 1_700_000_000,
        }
    }
}

impl BinlogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checksum(mut self, alg: u8) -> Self {
        self.checksum_alg = alg;
        self
    }

    /// Event with the given header fields; a checksum is appended when the
    /// writer uses CRC32.
    pub fn raw_event(&self, event_type: u8, flags: u16, body: &[u8], log_pos: u32) -> Vec<u8> {
        let trailer = if self.checksum_alg == BINLOG_CHECKSUM_ALG_CRC32
            && event_type != et::FORMAT_DESCRIPTION
        {
            BINLOG_CHECKSUM_LEN
        } else {
            0
        };
        let size = EVENT_HEADER_LEN + body.len() + trailer;

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32_le(self.timestamp);
        buf.put_u8(event_type);
        buf.put_u32_le(self.server_id);
        buf.put_u32_le(size as u32);
        buf.put_u32_le(log_pos);
        buf.put_u16_le(flags);
        buf.put_slice(body);
        buf.put_bytes(0, trailer);
        buf.to_vec()
    }

    pub fn format_description(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16_le(4);
        let mut version = [0u8; 50];
        version[..6].copy_from_slice(b"8.0.36");
        body.put_slice(&version);
        body.put_u32_le(self.timestamp);
        body.put_u8(EVENT_HEADER_LEN as u8);
        // post-header lengths, one per event type
        body.put_bytes(0, 40);
        body.put_u8(self.checksum_alg);
        body.put_bytes(0, BINLOG_CHECKSUM_LEN);
        self.raw_event(et::FORMAT_DESCRIPTION, 0, &body, 0)
    }

    /// Artificial rotate, as sent first on a new dump connection.
    pub fn rotate(&self, next_file: &str, position: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u64_le(u64::from(position));
        body.put_slice(next_file.as_bytes());
        self.raw_event(et::ROTATE, LOG_EVENT_ARTIFICIAL_F, &body, 0)
    }

    pub fn query(&self, schema: &str, query: &str, log_pos: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u32_le(1); // thread id
        body.put_u32_le(0); // exec time
        body.put_u8(schema.len() as u8);
        body.put_u16_le(0); // error code
        body.put_u16_le(0); // status vars
        body.put_slice(schema.as_bytes());
        body.put_u8(0);
        body.put_slice(query.as_bytes());
        self.raw_event(et::QUERY, 0, &body, log_pos)
    }

    pub fn xid(&self, xid: u64, log_pos: u32) -> Vec<u8> {
        self.raw_event(et::XID, 0, &xid.to_le_bytes(), log_pos)
    }

    pub fn gtid(&self, sid: [u8; 16], gno: u64, log_pos: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_slice(&sid);
        body.put_u64_le(gno);
        body.put_u8(2); // logical timestamp type code
        body.put_bytes(0, 16);
        self.raw_event(et::GTID, 0, &body, log_pos)
    }

    pub fn heartbeat(&self, log_file: &str) -> Vec<u8> {
        self.raw_event(et::HEARTBEAT, LOG_EVENT_ARTIFICIAL_F, log_file.as_bytes(), 0)
    }

    pub fn table_map(
        &self,
        table_id: u64,
        schema: &str,
        table: &str,
        types: &[u8],
        meta: &[u16],
        log_pos: u32,
    ) -> Vec<u8> {
        let mut body = BytesMut::new();
        put_u48(&mut body, table_id);
        body.put_u16_le(1); // end of statement
        body.put_u8(schema.len() as u8);
        body.put_slice(schema.as_bytes());
        body.put_u8(0);
        body.put_u8(table.len() as u8);
        body.put_slice(table.as_bytes());
        body.put_u8(0);
        put_packed_int(&mut body, types.len() as u64);
        body.put_slice(types);

        let mut encoded_meta = BytesMut::new();
        for (&t, &m) in types.iter().zip(meta.iter().chain(std::iter::repeat(&0))) {
            match t {
                ct::STRING | ct::SET | ct::ENUM | ct::NEWDECIMAL => {
                    encoded_meta.put_u16(m);
                }
                ct::VARCHAR | ct::VAR_STRING | ct::BIT => encoded_meta.put_u16_le(m),
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
                | ct::TIMESTAMP2 => encoded_meta.put_u8(m as u8),
                _ => {}
            }
        }
        put_packed_int(&mut body, encoded_meta.len() as u64);
        body.put_slice(&encoded_meta);

        body.put_bytes(0xFF, types.len().div_ceil(8));
        self.raw_event(et::TABLE_MAP, 0, &body, log_pos)
    }

    pub fn write_rows(&self, table_id: u64, types: &[u8], rows: &[Vec<Value>], log_pos: u32) -> Vec<u8> {
        self.rows_event(et::WRITE_ROWS_V2, table_id, types, rows, log_pos)
    }

    /// `rows` alternates before and after images.
    pub fn update_rows(&self, table_id: u64, types: &[u8], rows: &[Vec<Value>], log_pos: u32) -> Vec<u8> {
        self.rows_event(et::UPDATE_ROWS_V2, table_id, types, rows, log_pos)
    }

    pub fn delete_rows(&self, table_id: u64, types: &[u8], rows: &[Vec<Value>], log_pos: u32) -> Vec<u8> {
        self.rows_event(et::DELETE_ROWS_V2, table_id, types, rows, log_pos)
    }

    fn rows_event(
        &self,
        event_type: u8,
        table_id: u64,
        types: &[u8],
        rows: &[Vec<Value>],
        log_pos: u32,
    ) -> Vec<u8> {
        let bitmap_len = types.len().div_ceil(8);
        let mut body = BytesMut::new();
        put_u48(&mut body, table_id);
        body.put_u16_le(1);
        body.put_u16_le(2); // extra data length, itself included
        put_packed_int(&mut body, types.len() as u64);
        body.put_bytes(0xFF, bitmap_len);
        if event_type == et::UPDATE_ROWS_V2 {
            body.put_bytes(0xFF, bitmap_len);
        }

        for row in rows {
            let mut nulls = vec![0u8; bitmap_len];
            for (i, value) in row.iter().enumerate() {
                if value.is_null() {
                    nulls[i / 8] |= 1 << (i % 8);
                }
            }
            body.put_slice(&nulls);
            for (&t, value) in types.iter().zip(row) {
                if !value.is_null() {
                    put_value(&mut body, t, value);
                }
            }
        }

        self.raw_event(event_type, 0, &body, log_pos)
    }
}

/// Table map metadata matching how [`BinlogWriter`] encodes values.
pub fn default_meta(col_type: u8) -> u16 {
    match col_type {
        ct::VARCHAR | ct::VAR_STRING => 255,
        ct::STRING => (u16::from(ct::STRING) << 8) | 255,
        ct::BLOB | ct::JSON | ct::GEOMETRY => 2,
        ct::FLOAT => 4,
        ct::DOUBLE => 8,
        _ => 0,
    }
}

fn put_u48(buf: &mut BytesMut, v: u64) {
    buf.put_slice(&v.to_le_bytes()[..6]);
}

fn put_packed_int(buf: &mut BytesMut, v: u64) {
    match v {
        0..=250 => buf.put_u8(v as u8),
        251..=0xFFFF => {
            buf.put_u8(252);
            buf.put_u16_le(v as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(253);
            buf.put_slice(&v.to_le_bytes()[..3]);
        }
        _ => {
            buf.put_u8(254);
            buf.put_u64_le(v);
        }
    }
}

fn put_value(buf: &mut BytesMut, col_type: u8, value: &Value) {
    let int = value.as_i64().unwrap_or(0);
    match col_type {
        ct::TINY => buf.put_i8(int as i8),
        ct::SHORT => buf.put_i16_le(int as i16),
        ct::INT24 => buf.put_slice(&int.to_le_bytes()[..3]),
        ct::LONG => buf.put_i32_le(int as i32),
        ct::LONGLONG => buf.put_i64_le(int),
        ct::FLOAT => buf.put_f32_le(value.as_f64().unwrap_or(0.0) as f32),
        ct::DOUBLE => buf.put_f64_le(value.as_f64().unwrap_or(0.0)),
        ct::BLOB | ct::JSON | ct::GEOMETRY => {
            let bytes = value.as_bytes().unwrap_or_default();
            buf.put_u16_le(bytes.len() as u16);
            buf.put_slice(bytes);
        }
        _ => {
            let bytes = value.as_bytes().unwrap_or_default();
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
    }
}
