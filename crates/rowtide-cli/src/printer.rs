use std::io::Write;
use std::time::Duration;

use colored::Colorize;
use rowtide_core::{
    DdlEvent, EventHandler, HandlerError, HandlerResult, Position, RotateEvent, RowEvent,
    TransactionBoundary,
};
use tracing::{debug, info};

/// Writes every row event as one JSON object per line.
///
/// Schema changes and rotates go to stderr so the output stays parseable.
pub struct JsonLinesHandler<W> {
    out: W,
    rows: u64,
    last_synced: Option<Position>,
}

impl<W: Write + Send> JsonLinesHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            rows: 0,
            last_synced: None,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn last_synced(&self) -> Option<&Position> {
        self.last_synced.as_ref()
    }
}

impl<W: Write + Send> EventHandler for JsonLinesHandler<W> {
    fn on_row(&mut self, event: &RowEvent) -> HandlerResult {
        let line = serde_json::to_string(&event.to_json())
            .map_err(|e| HandlerError::with_source("failed to encode row event", e))?;
        writeln!(self.out, "{line}")
            .map_err(|e| HandlerError::with_source("failed to write row event", e))?;
        self.rows += event.rows.len() as u64;
        Ok(())
    }

    fn on_xid(&mut self, boundary: &TransactionBoundary) -> HandlerResult {
        self.out
            .flush()
            .map_err(|e| HandlerError::with_source("failed to flush output", e))?;
        debug!(xid = ?boundary.xid, gtid = ?boundary.gtid, position = %boundary.position, "commit");
        Ok(())
    }

    fn on_ddl(&mut self, ddl: &DdlEvent) -> HandlerResult {
        let tables: Vec<String> = ddl.tables.iter().map(ToString::to_string).collect();
        eprintln!(
            "{} {} ({})",
            "schema change:".yellow(),
            ddl.query,
            tables.join(", ")
        );
        Ok(())
    }

    fn on_rotate(&mut self, rotate: &RotateEvent) -> HandlerResult {
        info!(position = %rotate.next, "rotated");
        Ok(())
    }

    fn on_position_synced(&mut self, position: &Position, _force: bool) -> HandlerResult {
        self.last_synced = Some(position.clone());
        Ok(())
    }

    fn on_heartbeat_timeout(&mut self, idle: Duration) {
        eprintln!(
            "{}",
            format!("No data from the source for {idle:?}, reconnecting").yellow()
        );
    }

    fn on_stream_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        eprintln!("{}", format!("Stream failed: {error}").red());
    }

    fn name(&self) -> &str {
        "json-lines"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowtide_core::{Action, Column, TableMeta, Value};
    use std::sync::Arc;

    fn event() -> RowEvent {
        let table = TableMeta::new("test", "canal_test")
            .with_column(Column::new("id", "int(11)"))
            .with_column(Column::new("name", "varchar(255)"));
        RowEvent {
            table: Arc::new(table),
            action: Action::Insert,
            rows: vec![
                vec![Value::Int(1), Value::String("a".to_string())],
                vec![Value::Int(2), Value::Null],
            ],
            position: Position::new("mysql-bin.000001", 400),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_row_is_one_json_line() {
        let mut handler = JsonLinesHandler::new(Vec::new());
        handler.on_row(&event()).unwrap();
        handler.on_row(&event()).unwrap();
        assert_eq!(handler.rows(), 4);

        let out = String::from_utf8(handler.out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let json: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(json["action"], "insert");
        assert_eq!(json["table"], "canal_test");
        assert_eq!(json["rows"][0]["name"], "a");
        assert!(json["rows"][1]["name"].is_null());
    }

    #[test]
    fn test_tracks_synced_position() {
        let mut handler = JsonLinesHandler::new(Vec::new());
        assert!(handler.last_synced().is_none());
        handler
            .on_position_synced(&Position::new("mysql-bin.000002", 4), true)
            .unwrap();
        assert_eq!(
            handler.last_synced(),
            Some(&Position::new("mysql-bin.000002", 4))
        );
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_is_handler_error() {
        let mut handler = JsonLinesHandler::new(BrokenPipe);
        let err = handler.on_row(&event()).unwrap_err();
        assert_eq!(err.message(), "failed to write row event");
    }
}
