//! Initial snapshot: replay a consistent `mysqldump` as insert events.
//!
//! The dump runs with `--single-transaction --master-data`, so the binlog
//! coordinates it prints describe exactly the data that follows. Streaming
//! resumes from those coordinates once the dump has been consumed.

pub mod dump;
pub mod parser;

use std::sync::Arc;

use rowtide_config::DumpConfig;
use rowtide_core::{Action, EventHandler, Position, RowEvent, TableMeta};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{CanalError, CanalResult};
use crate::registry::SchemaRegistry;
use crate::source::{DumpHandle, Upstream};

pub use dump::{dump_args, MysqlDump};
pub use parser::{DumpParser, DumpStatement, DumpValue};

/// Rows and statements replayed by one snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub statements: usize,
    pub rows: usize,
    pub skipped: usize,
}

pub struct SnapshotCoordinator<'a, U> {
    upstream: &'a U,
    registry: &'a SchemaRegistry,
    config: &'a DumpConfig,
    discard_no_meta: bool,
    cancel: &'a CancellationToken,
}

impl<'a, U: Upstream> SnapshotCoordinator<'a, U> {
    pub fn new(
        upstream: &'a U,
        registry: &'a SchemaRegistry,
        config: &'a DumpConfig,
        discard_no_meta: bool,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            upstream,
            registry,
            config,
            discard_no_meta,
            cancel,
        }
    }

    /// Run the dump and deliver its rows.
    ///
    /// Returns the position streaming continues from, or `None` when the
    /// snapshot phase is disabled.
    pub async fn run<H: EventHandler>(
        &self,
        dispatcher: &mut Dispatcher<H>,
    ) -> CanalResult<Option<Position>> {
        if !self.config.is_enabled() {
            debug!("snapshot disabled");
            return Ok(None);
        }

        let mut marker = None;
        if self.config.skip_master_data {
            let head = self
                .upstream
                .master_position()
                .await
                .map_err(|e| CanalError::Snapshot(format!("failed to read master position: {e}")))?;
            warn!(
                position = %head,
                "skip_master_data is set; rows written while the dump runs may be delivered twice"
            );
            marker = Some(head);
        }

        let Some(mut dump) = self
            .upstream
            .start_dump()
            .await
            .map_err(|e| match e {
                CanalError::Snapshot(_) => e,
                other => CanalError::Snapshot(other.to_string()),
            })?
        else {
            return Ok(None);
        };

        let mut stats = SnapshotStats::default();
        let result = self
            .consume(&mut dump, dispatcher, &mut marker, &mut stats)
            .await;
        if let Err(e) = result {
            dump.abort().await;
            return Err(e);
        }

        dump.wait().await?;

        let marker = marker.ok_or_else(|| {
            CanalError::Snapshot("dump finished without a master position marker".into())
        })?;
        info!(
            position = %marker,
            statements = stats.statements,
            rows = stats.rows,
            skipped = stats.skipped,
            "snapshot complete"
        );
        Ok(Some(marker))
    }

    async fn consume<H: EventHandler>(
        &self,
        dump: &mut U::Dump,
        dispatcher: &mut Dispatcher<H>,
        marker: &mut Option<Position>,
        stats: &mut SnapshotStats,
    ) -> CanalResult<()> {
        let parser = DumpParser::new()?;
        let mut db = self.config.table_db.clone();
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CanalError::Closed),
                read = dump.output().read_until(b'\n', &mut line) => read?,
            };
            if read == 0 {
                return Ok(());
            }

            let text = String::from_utf8_lossy(&line);
            match parser.parse_line(&text)? {
                None => {}
                Some(DumpStatement::Marker(position)) => {
                    debug!(position = %position, "dump marker");
                    *marker = Some(position);
                }
                Some(DumpStatement::Use(name)) => db = name,
                Some(DumpStatement::Insert { table, rows }) => {
                    let Some(position) = marker.clone() else {
                        return Err(CanalError::Snapshot(
                            "row data before the master position marker".into(),
                        ));
                    };
                    let Some(meta) = self.table(&db, &table, &rows).await? else {
                        stats.skipped += rows.len();
                        continue;
                    };

                    let images = rows
                        .into_iter()
                        .map(|row| {
                            row.into_iter()
                                .zip(meta.columns.iter())
                                .map(|(value, column)| value.into_value(column))
                                .collect()
                        })
                        .collect::<Vec<_>>();

                    stats.statements += 1;
                    stats.rows += images.len();
                    dispatcher.row(&RowEvent {
                        table: meta,
                        action: Action::Insert,
                        rows: images,
                        position,
                        timestamp: 0,
                    })?;
                }
            }
        }
    }

    /// Metadata for a dumped table; `None` when its rows should be skipped.
    ///
    /// Cached metadata that disagrees with the dump's row width is reloaded
    /// once before giving up.
    async fn table(
        &self,
        db: &str,
        table: &str,
        rows: &[Vec<DumpValue>],
    ) -> CanalResult<Option<Arc<TableMeta>>> {
        let mut reloaded = false;
        loop {
            let meta = match self.registry.get_table(self.upstream, db, table).await {
                Ok(meta) => meta,
                Err(e) if e.is_excluded_table() => {
                    debug!(db, table, "skipping dump rows for excluded table");
                    return Ok(None);
                }
                Err(e) if e.is_table_not_found() && self.discard_no_meta => {
                    warn!(db, table, "skipping dump rows for table without metadata");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let Some(bad) = rows.iter().find(|row| row.len() != meta.columns.len()) else {
                return Ok(Some(meta));
            };
            if reloaded {
                return Err(CanalError::Snapshot(format!(
                    "{}.{}: dump row has {} values, table has {} columns",
                    db,
                    table,
                    bad.len(),
                    meta.columns.len()
                )));
            }
            self.registry.invalidate(db, table);
            reloaded = true;
        }
    }
}
