//! The binlog streaming loop.
//!
//! Reads packets through the liveness monitor, decodes them and turns each
//! event into handler callbacks while keeping the position tracker current.
//! Returns only with an error; a clean close surfaces as
//! [`CanalError::Closed`].

use std::sync::Arc;

use rowtide_core::{
    parse_ddl, trim_statement, Action, DdlEvent, EventHandler, Position, RotateEvent, RowEvent,
    TableMeta, TransactionBoundary,
};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dispatch::Dispatcher;
use crate::error::{CanalError, CanalResult, DecodeError};
use crate::liveness::LivenessMonitor;
use crate::registry::SchemaRegistry;
use crate::replication::event::{QueryEvent, RotateEvent as BinlogRotate};
use crate::replication::{BinlogDecoder, BinlogEvent, Frame, LogEvent, PacketFramer, RowsEvent, RowsKind};
use crate::source::MetadataSource;
use crate::sync::PositionTracker;

pub struct StreamRunner<'a, M, H> {
    source: &'a M,
    registry: &'a SchemaRegistry,
    tracker: &'a PositionTracker,
    dispatcher: &'a mut Dispatcher<H>,
    cancel: &'a CancellationToken,
    liveness: LivenessMonitor,
    decoder: BinlogDecoder,
    framer: PacketFramer,
    discard_no_meta: bool,
    /// Events ending at or before this position were already delivered.
    replay_until: Option<Position>,
    /// Binlog file the events being read belong to.
    file: String,
    /// GTID of the transaction in progress.
    gtid: Option<String>,
}

impl<'a, M: MetadataSource, H: EventHandler> StreamRunner<'a, M, H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'a M,
        registry: &'a SchemaRegistry,
        tracker: &'a PositionTracker,
        dispatcher: &'a mut Dispatcher<H>,
        cancel: &'a CancellationToken,
        liveness: LivenessMonitor,
        discard_no_meta: bool,
        start: &Position,
    ) -> Self {
        Self {
            source,
            registry,
            tracker,
            dispatcher,
            cancel,
            liveness,
            decoder: BinlogDecoder::new(),
            framer: PacketFramer::new(),
            discard_no_meta,
            replay_until: None,
            file: start.name.clone(),
            gtid: None,
        }
    }

    /// Suppress delivery of events that end at or before `until`.
    pub fn replay_until(mut self, until: Position) -> Self {
        self.replay_until = Some(until);
        self
    }

    pub async fn run<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> CanalResult<()> {
        info!(position = %self.tracker.current(), "streaming binlog");
        loop {
            let frame = match self.framer.next_frame()? {
                Some(frame) => frame,
                None => {
                    self.liveness
                        .read(reader, self.framer.buffer_mut(), self.cancel)
                        .await?;
                    continue;
                }
            };

            match frame {
                Frame::Event(data) => {
                    let event = self.decoder.decode(&data)?;
                    self.handle(event).await?;
                }
                Frame::Eof => {
                    return Err(CanalError::Connection("binlog stream ended by server".into()))
                }
                Frame::Error { code, message } => {
                    return Err(CanalError::Server { code, message })
                }
            }
        }
    }

    fn replaying(&self, at: &Position) -> bool {
        self.replay_until.as_ref().is_some_and(|until| at <= until)
    }

    async fn handle(&mut self, event: LogEvent) -> CanalResult<()> {
        let header = event.header;
        let next = if header.log_pos > 0 && !header.is_artificial() {
            Position::new(&self.file, header.log_pos)
        } else {
            self.tracker.current()
        };
        trace!(event_type = header.event_type, position = %next, "event");

        match event.body {
            BinlogEvent::Rotate(rotate) => self.on_rotate(rotate, header.timestamp)?,
            BinlogEvent::Query(query) => self.on_query(query, next, header.timestamp)?,
            BinlogEvent::Xid(xid) => {
                self.on_boundary(Some(xid.xid), next, header.timestamp)?;
            }
            BinlogEvent::Gtid(gtid) => {
                self.gtid = Some(gtid.gtid());
                self.tracker.advance(next);
            }
            BinlogEvent::Rows(rows) => self.on_rows(rows, next, header.timestamp).await?,
            BinlogEvent::Heartbeat(_) => self.liveness.record_heartbeat(),
            BinlogEvent::FormatDescription(_) | BinlogEvent::TableMap(_) | BinlogEvent::Ignored(_) => {
                self.tracker.advance(next);
            }
        }
        Ok(())
    }

    fn on_rotate(&mut self, rotate: BinlogRotate, timestamp: u32) -> CanalResult<()> {
        let pos = u32::try_from(rotate.position).unwrap_or(u32::MAX);
        let next = Position::new(&rotate.next_file, pos);
        self.file = rotate.next_file;

        if self.tracker.advance(next.clone()) {
            info!(position = %next, "binlog rotated");
            if !self.replaying(&next) {
                self.dispatcher.rotate(&RotateEvent {
                    next: next.clone(),
                    timestamp,
                })?;
            }
            self.tracker.mark_synced(next);
        }
        Ok(())
    }

    fn on_query(&mut self, query: QueryEvent, next: Position, timestamp: u32) -> CanalResult<()> {
        let statement = trim_statement(&query.query);
        if statement == "BEGIN" {
            self.tracker.advance(next);
            return Ok(());
        }
        if statement == "COMMIT" {
            return self.on_boundary(None, next, timestamp);
        }

        let Some(ddl) = parse_ddl(&query.query, &query.schema) else {
            self.tracker.advance(next);
            return Ok(());
        };

        let replaying = self.replaying(&next);
        let mut allowed = Vec::new();
        for table in ddl.tables {
            self.registry.invalidate(&table.schema, &table.table);
            if self.registry.is_allowed(&table.schema, &table.table) {
                if !replaying {
                    self.dispatcher.table_changed(&table)?;
                }
                allowed.push(table);
            }
        }

        debug!(
            kind = ?ddl.kind,
            schema = %query.schema,
            tables = allowed.len(),
            position = %next,
            "ddl"
        );

        if !replaying {
            if !allowed.is_empty() {
                self.dispatcher.ddl(&DdlEvent {
                    schema: query.schema,
                    query: query.query,
                    kind: ddl.kind,
                    tables: allowed,
                    position: next.clone(),
                    timestamp,
                })?;
            }
            self.dispatcher.position_synced(&next, true)?;
        }
        self.tracker.mark_synced(next);
        Ok(())
    }

    fn on_boundary(&mut self, xid: Option<u64>, next: Position, timestamp: u32) -> CanalResult<()> {
        let boundary = TransactionBoundary {
            xid,
            gtid: self.gtid.take(),
            position: next.clone(),
            timestamp,
        };
        if !self.replaying(&next) {
            self.dispatcher.xid(&boundary)?;
        }
        self.tracker.mark_synced(next);
        Ok(())
    }

    async fn on_rows(&mut self, rows: RowsEvent, next: Position, timestamp: u32) -> CanalResult<()> {
        let Some(map) = self.decoder.table_map(rows.table_id) else {
            return Err(DecodeError::MissingTableMap(rows.table_id).into());
        };
        let (schema, table) = (map.schema.clone(), map.table.clone());

        let Some(meta) = self.table(&schema, &table, rows.column_count).await? else {
            self.tracker.advance(next);
            return Ok(());
        };

        if !self.replaying(&next) {
            let images = rows
                .rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .zip(meta.columns.iter())
                        .map(|(value, column)| column.coerce(value))
                        .collect()
                })
                .collect();

            self.dispatcher.row(&RowEvent {
                table: meta,
                action: match rows.kind {
                    RowsKind::Write => Action::Insert,
                    RowsKind::Update => Action::Update,
                    RowsKind::Delete => Action::Delete,
                },
                rows: images,
                position: next.clone(),
                timestamp,
            })?;
        }
        self.tracker.advance(next);
        Ok(())
    }

    /// Metadata for the table a rows event belongs to; `None` when its rows
    /// are dropped.
    async fn table(
        &self,
        schema: &str,
        table: &str,
        column_count: usize,
    ) -> CanalResult<Option<Arc<TableMeta>>> {
        let mut reloaded = false;
        loop {
            let meta = match self.registry.get_table(self.source, schema, table).await {
                Ok(meta) => meta,
                Err(e) if e.is_excluded_table() => {
                    trace!(schema, table, "dropping rows for excluded table");
                    return Ok(None);
                }
                Err(e) if e.is_table_not_found() && self.discard_no_meta => {
                    warn!(schema, table, "dropping rows for table without metadata");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if meta.columns.len() == column_count {
                return Ok(Some(meta));
            }
            if reloaded {
                return Err(DecodeError::SchemaMismatch {
                    table: format!("{schema}.{table}"),
                    expected: meta.columns.len(),
                    actual: column_count,
                }
                .into());
            }
            debug!(schema, table, "column count changed, reloading metadata");
            self.registry.invalidate(schema, table);
            reloaded = true;
        }
    }
}
