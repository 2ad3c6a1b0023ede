//! Delivery of engine events to the consumer's handler.
//!
//! Keeps callback ordering in one place: a commit is followed by a
//! non-forced position sync, a rotate by a forced one.

use std::time::Duration;

use rowtide_core::{
    DdlEvent, EventHandler, Position, RotateEvent, RowEvent, TableRef, TransactionBoundary,
};
use tracing::{debug, error, warn};

use crate::error::{CanalError, CanalResult};

#[derive(Debug)]
pub struct Dispatcher<H> {
    handler: H,
}

impl<H: EventHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn row(&mut self, event: &RowEvent) -> CanalResult<()> {
        debug!(
            table = %event.table.table_ref(),
            action = %event.action,
            rows = event.rows.len(),
            position = %event.position,
            "dispatching rows"
        );
        self.handler.on_row(event).map_err(CanalError::from)
    }

    /// A committed transaction, followed by its position sync.
    pub fn xid(&mut self, boundary: &TransactionBoundary) -> CanalResult<()> {
        self.handler.on_xid(boundary)?;
        self.handler.on_position_synced(&boundary.position, false)?;
        Ok(())
    }

    pub fn ddl(&mut self, ddl: &DdlEvent) -> CanalResult<()> {
        debug!(schema = %ddl.schema, kind = ?ddl.kind, tables = ddl.tables.len(), "dispatching ddl");
        self.handler.on_ddl(ddl).map_err(CanalError::from)
    }

    pub fn table_changed(&mut self, table: &TableRef) -> CanalResult<()> {
        self.handler.on_table_changed(table).map_err(CanalError::from)
    }

    pub fn rotate(&mut self, rotate: &RotateEvent) -> CanalResult<()> {
        self.handler.on_rotate(rotate)?;
        self.handler.on_position_synced(&rotate.next, true)?;
        Ok(())
    }

    pub fn position_synced(&mut self, position: &Position, force: bool) -> CanalResult<()> {
        self.handler
            .on_position_synced(position, force)
            .map_err(CanalError::from)
    }

    pub fn heartbeat_timeout(&mut self, idle: Duration) {
        warn!(handler = self.handler.name(), idle = ?idle, "binlog stream idle past read timeout");
        self.handler.on_heartbeat_timeout(idle);
    }

    pub fn stream_error(&mut self, err: &CanalError) {
        error!(handler = self.handler.name(), error = %err, "binlog stream failed");
        self.handler.on_stream_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowtide_core::{HandlerError, HandlerResult};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_xid: bool,
    }

    impl EventHandler for Recorder {
        fn on_xid(&mut self, boundary: &TransactionBoundary) -> HandlerResult {
            if self.fail_xid {
                return Err(HandlerError::new("sink unavailable"));
            }
            self.calls.push(format!("xid {:?}", boundary.xid));
            Ok(())
        }

        fn on_rotate(&mut self, rotate: &RotateEvent) -> HandlerResult {
            self.calls.push(format!("rotate {}", rotate.next));
            Ok(())
        }

        fn on_position_synced(&mut self, position: &Position, force: bool) -> HandlerResult {
            self.calls.push(format!("synced {position} {force}"));
            Ok(())
        }

        fn on_stream_error(&mut self, error: &(dyn std::error::Error + 'static)) {
            self.calls.push(format!("error {error}"));
        }
    }

    fn boundary() -> TransactionBoundary {
        TransactionBoundary {
            xid: Some(42),
            gtid: None,
            position: Position::new("mysql-bin.000001", 310),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_callback_order() {
        let mut dispatcher = Dispatcher::new(Recorder::default());
        dispatcher.xid(&boundary()).unwrap();
        dispatcher
            .rotate(&RotateEvent {
                next: Position::new("mysql-bin.000002", 4),
                timestamp: 0,
            })
            .unwrap();
        dispatcher.stream_error(&CanalError::Closed);

        assert_eq!(
            dispatcher.handler().calls,
            vec![
                "xid Some(42)",
                "synced mysql-bin.000001:310 false",
                "rotate mysql-bin.000002:4",
                "synced mysql-bin.000002:4 true",
                "error engine closed",
            ]
        );
    }

    #[test]
    fn test_handler_error_skips_sync() {
        let mut dispatcher = Dispatcher::new(Recorder {
            fail_xid: true,
            ..Recorder::default()
        });
        let err = dispatcher.xid(&boundary()).unwrap_err();
        assert!(matches!(err, CanalError::Handler(e) if e.message() == "sink unavailable"));
        assert!(dispatcher.into_handler().calls.is_empty());
    }
}
