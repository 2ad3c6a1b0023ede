//! The replication engine.
//!
//! A [`Canal`] runs the snapshot once, then streams the binlog from the
//! snapshot's position, delivering everything to a single
//! [`EventHandler`]. `run` blocks the calling task; every other method may
//! be called concurrently from other tasks through a shared reference.

use std::sync::Arc;
use std::time::Duration;

use rowtide_config::{validate_config, CanalConfig};
use rowtide_core::{EventHandler, Position, TableMeta};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{CanalError, CanalResult};
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::registry::SchemaRegistry;
use crate::snapshot::SnapshotCoordinator;
use crate::source::Upstream;
use crate::stream::StreamRunner;
use crate::sync::{EngineState, PositionTracker, SnapshotLatch, SnapshotStatus, StateCell};
use crate::upstream::MySqlUpstream;

pub struct Canal<U, H> {
    config: CanalConfig,
    upstream: U,
    registry: SchemaRegistry,
    state: StateCell,
    snapshot: SnapshotLatch,
    tracker: PositionTracker,
    cancel: CancellationToken,
    /// Held by the run loop for as long as it runs.
    dispatcher: Mutex<Dispatcher<H>>,
}

impl<H: EventHandler> Canal<MySqlUpstream, H> {
    /// Engine replicating from the server named in `config`.
    pub fn connect(config: CanalConfig, handler: H) -> CanalResult<Self> {
        let upstream = MySqlUpstream::new(config.clone())?;
        Self::new(config, upstream, handler)
    }

    /// Run a statement on the source, outside the replication stream.
    pub async fn execute(&self, sql: &str) -> CanalResult<Vec<mysql_async::Row>> {
        self.upstream.execute(sql).await
    }
}

impl<U: Upstream, H: EventHandler> Canal<U, H> {
    pub fn new(config: CanalConfig, upstream: U, handler: H) -> CanalResult<Self> {
        validate_config(&config)?;
        let filter = config.table_filter()?;

        Ok(Self {
            registry: SchemaRegistry::new(filter),
            upstream,
            config,
            state: StateCell::default(),
            snapshot: SnapshotLatch::default(),
            tracker: PositionTracker::default(),
            cancel: CancellationToken::new(),
            dispatcher: Mutex::new(Dispatcher::new(handler)),
        })
    }

    pub fn config(&self) -> &CanalConfig {
        &self.config
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Position after the last processed event.
    pub fn position(&self) -> Position {
        self.tracker.current()
    }

    /// Position after the last transaction boundary, rotate or DDL.
    pub fn synced_position(&self) -> Position {
        self.tracker.synced()
    }

    /// Snapshot, then stream until closed or a fatal error.
    ///
    /// Returns `Ok(())` after [`Canal::close`]. After a
    /// [`CanalError::StreamTimeout`] it may be called again to reconnect.
    pub async fn run(&self) -> CanalResult<()> {
        self.run_with(None).await
    }

    /// Skip the snapshot and stream from `position`.
    pub async fn run_from(&self, position: Position) -> CanalResult<()> {
        self.run_with(Some(position)).await
    }

    async fn run_with(&self, from: Option<Position>) -> CanalResult<()> {
        let mut dispatcher = self
            .dispatcher
            .try_lock()
            .map_err(|_| CanalError::AlreadyRunning)?;

        let state = self.state.get();
        if state.is_terminal() {
            return Err(CanalError::InvalidState(state));
        }

        let result = self.run_inner(&mut dispatcher, from).await;
        self.finish(&mut dispatcher, result)
    }

    async fn run_inner(
        &self,
        dispatcher: &mut Dispatcher<H>,
        from: Option<Position>,
    ) -> CanalResult<()> {
        let mut replay_until = None;
        let start = match (self.state.get(), from) {
            (EngineState::Created | EngineState::SnapshotRunning, from) => {
                let start = match from {
                    Some(position) => {
                        info!(position = %position, "skipping snapshot");
                        position
                    }
                    None => self.run_snapshot(dispatcher).await?,
                };
                self.tracker.reset(start.clone());
                self.snapshot.resolve(SnapshotStatus::Done);
                self.state.set(EngineState::SnapshotDone);
                start
            }
            (_, Some(position)) => {
                let current = self.tracker.current();
                if current > position {
                    replay_until = Some(current);
                }
                info!(position = %position, "restarting stream");
                position
            }
            (_, None) => {
                let synced = self.tracker.synced();
                let current = self.tracker.current();
                if current > synced {
                    replay_until = Some(current);
                }
                info!(position = %synced, "resuming stream");
                synced
            }
        };

        self.state.set(EngineState::Streaming);
        let mut binlog = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CanalError::Closed),
            binlog = self.upstream.open_binlog(&start) => binlog?,
        };

        let liveness = LivenessMonitor::new(LivenessConfig::from_config(&self.config));
        let mut runner = StreamRunner::new(
            &self.upstream,
            &self.registry,
            &self.tracker,
            dispatcher,
            &self.cancel,
            liveness,
            self.config.discard_no_meta_row_events,
            &start,
        );
        if let Some(until) = replay_until {
            runner = runner.replay_until(until);
        }
        runner.run(&mut binlog).await
    }

    async fn run_snapshot(&self, dispatcher: &mut Dispatcher<H>) -> CanalResult<Position> {
        self.state.set(EngineState::SnapshotRunning);
        let coordinator = SnapshotCoordinator::new(
            &self.upstream,
            &self.registry,
            &self.config.dump,
            self.config.discard_no_meta_row_events,
            &self.cancel,
        );

        match coordinator.run(dispatcher).await? {
            Some(marker) => Ok(marker),
            None => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(CanalError::Closed),
                head = self.upstream.master_position() => head,
            },
        }
    }

    fn finish(&self, dispatcher: &mut Dispatcher<H>, result: CanalResult<()>) -> CanalResult<()> {
        match result {
            Err(e) if e.is_closed() || self.cancel.is_cancelled() => {
                self.state.set(EngineState::Closed);
                self.snapshot.resolve(SnapshotStatus::Aborted);
                info!(position = %self.tracker.current(), "canal closed");
                Ok(())
            }
            Ok(()) => {
                self.state.set(EngineState::Closed);
                self.snapshot.resolve(SnapshotStatus::Aborted);
                Ok(())
            }
            Err(CanalError::StreamTimeout(idle)) => {
                dispatcher.heartbeat_timeout(idle);
                Err(CanalError::StreamTimeout(idle))
            }
            Err(e) => {
                dispatcher.stream_error(&e);
                self.state.set(EngineState::Failed);
                self.snapshot.resolve(SnapshotStatus::Aborted);
                Err(e)
            }
        }
    }

    /// Stop the engine. Safe to call repeatedly and from any task.
    ///
    /// A blocked `run` returns `Ok(())` promptly, a running dump is killed
    /// and pending waits fail with [`CanalError::Closed`].
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("closing canal");
        }
        self.cancel.cancel();
        self.state.set(EngineState::Closed);
        self.snapshot.resolve(SnapshotStatus::Aborted);
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Metadata of an allowed table.
    ///
    /// Fails with [`CanalError::ExcludedTable`] for filtered tables, even
    /// ones that do not exist.
    pub async fn get_table(&self, schema: &str, table: &str) -> CanalResult<Arc<TableMeta>> {
        self.registry.get_table(&self.upstream, schema, table).await
    }

    /// Whether rows of `schema.table` pass the table filter.
    pub fn check_table_match(&self, schema: &str, table: &str) -> bool {
        self.registry.is_allowed(schema, table)
    }

    /// Wait until the snapshot phase has completed.
    pub async fn wait_snapshot_done(&self) -> CanalResult<()> {
        let status = tokio::select! {
            biased;
            status = self.snapshot.wait() => status,
            _ = self.cancel.cancelled() => SnapshotStatus::Aborted,
        };
        match status {
            SnapshotStatus::Done => Ok(()),
            SnapshotStatus::Pending | SnapshotStatus::Aborted => Err(CanalError::Closed),
        }
    }

    /// Wait until the engine has processed everything the source had
    /// written when this was called.
    ///
    /// `timeout` bounds the whole call, including the head position query.
    pub async fn catch_position(&self, timeout: Duration) -> CanalResult<()> {
        let deadline = Instant::now() + timeout;
        let head = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CanalError::Closed),
            head = tokio::time::timeout_at(deadline, self.upstream.master_position()) => head,
        };
        let target = match head {
            Ok(target) => target?,
            Err(_) => {
                warn!(?timeout, "source head position not returned in time");
                return Err(CanalError::HeadTimeout(timeout));
            }
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.catch_position_to(target, remaining).await
    }

    /// Wait until the processed position reaches `target`.
    pub async fn catch_position_to(&self, target: Position, timeout: Duration) -> CanalResult<()> {
        let mut rx = self.tracker.subscribe();
        let reached = async {
            tokio::select! {
                biased;
                seen = rx.wait_for(|current| *current >= target) => {
                    seen.map(|_| ()).map_err(|_| CanalError::Closed)
                }
                _ = self.cancel.cancelled() => Err(CanalError::Closed),
            }
        };

        let outcome = tokio::time::timeout(timeout, reached).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let current = self.tracker.current();
                warn!(target = %target, current = %current, "position not reached in time");
                Err(CanalError::SyncTimeout { target, current })
            }
        }
    }

    /// Take the handler back once the engine is done with it.
    pub fn into_handler(self) -> H {
        self.dispatcher.into_inner().into_handler()
    }
}
