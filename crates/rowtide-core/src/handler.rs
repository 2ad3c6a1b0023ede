//! Consumer callbacks.
//!
//! An [`EventHandler`] receives events synchronously and in source commit
//! order. Every method has a no-op default, so an implementation overrides
//! only what it needs. Returning an error from any callback stops the engine
//! and becomes the result of its run loop.

use std::time::Duration;

use thiserror::Error;

use crate::position::Position;
use crate::schema::TableRef;
use crate::statement::DdlKind;
use crate::types::RowEvent;

/// Error returned by a consumer callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// The binlog moved to another file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    /// First position in the new file.
    pub next: Position,
    pub timestamp: u32,
}

/// A schema-altering statement seen in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlEvent {
    /// Database the statement ran in.
    pub schema: String,
    /// Statement text as logged by the server.
    pub query: String,
    pub kind: DdlKind,
    /// Tables named by the statement that pass the table filter.
    pub tables: Vec<TableRef>,
    /// Position after the statement.
    pub position: Position,
    pub timestamp: u32,
}

/// End of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBoundary {
    /// Present for XID commits; `None` for `COMMIT` query events.
    pub xid: Option<u64>,
    /// `uuid:gno` of the transaction when GTIDs are enabled.
    pub gtid: Option<String>,
    /// Position after the commit, a safe point to resume from.
    pub position: Position,
    pub timestamp: u32,
}

/// Callbacks invoked by the engine.
#[allow(unused_variables)]
pub trait EventHandler: Send {
    /// Rows inserted, updated or deleted by one statement.
    fn on_row(&mut self, event: &RowEvent) -> HandlerResult {
        Ok(())
    }

    /// A transaction committed.
    fn on_xid(&mut self, boundary: &TransactionBoundary) -> HandlerResult {
        Ok(())
    }

    /// A DDL statement touched one or more allowed tables.
    fn on_ddl(&mut self, ddl: &DdlEvent) -> HandlerResult {
        Ok(())
    }

    /// Cached metadata for `table` was invalidated; called before `on_ddl`.
    fn on_table_changed(&mut self, table: &TableRef) -> HandlerResult {
        Ok(())
    }

    fn on_rotate(&mut self, rotate: &RotateEvent) -> HandlerResult {
        Ok(())
    }

    /// A position that is safe to persist and resume from. `force` is set
    /// after rotates and DDL, where consumers should not batch the save.
    fn on_position_synced(&mut self, position: &Position, force: bool) -> HandlerResult {
        Ok(())
    }

    /// No data arrived within the read timeout. The run loop returns a
    /// stream timeout right after this call.
    fn on_heartbeat_timeout(&mut self, idle: Duration) {}

    /// The run loop is about to stop with a fatal error.
    fn on_stream_error(&mut self, error: &(dyn std::error::Error + 'static)) {}

    fn name(&self) -> &str {
        "noop"
    }
}

/// Handler that accepts every event and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

impl<H: EventHandler + ?Sized> EventHandler for Box<H> {
    fn on_row(&mut self, event: &RowEvent) -> HandlerResult {
        (**self).on_row(event)
    }

    fn on_xid(&mut self, boundary: &TransactionBoundary) -> HandlerResult {
        (**self).on_xid(boundary)
    }

    fn on_ddl(&mut self, ddl: &DdlEvent) -> HandlerResult {
        (**self).on_ddl(ddl)
    }

    fn on_table_changed(&mut self, table: &TableRef) -> HandlerResult {
        (**self).on_table_changed(table)
    }

    fn on_rotate(&mut self, rotate: &RotateEvent) -> HandlerResult {
        (**self).on_rotate(rotate)
    }

    fn on_position_synced(&mut self, position: &Position, force: bool) -> HandlerResult {
        (**self).on_position_synced(position, force)
    }

    fn on_heartbeat_timeout(&mut self, idle: Duration) {
        (**self).on_heartbeat_timeout(idle)
    }

    fn on_stream_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        (**self).on_stream_error(error)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
