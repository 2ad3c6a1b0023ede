use std::time::Duration;

use thiserror::Error;

use rowtide_core::{HandlerError, Position};

use crate::sync::EngineState;

/// Failure to interpret bytes from the binlog stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated {context}: {source}")]
    Truncated {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported binlog event type {0} (0x{0:02X})")]
    Unsupported(u8),

    #[error("unsupported column type {0} (0x{0:02X})")]
    UnsupportedColumn(u8),

    #[error("rows event references unknown table id {0}")]
    MissingTableMap(u64),

    #[error("table {table} has {expected} columns in metadata but {actual} in the binlog")]
    SchemaMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for DecodeError {
    fn from(source: std::io::Error) -> Self {
        DecodeError::Truncated {
            context: "event",
            source,
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors surfaced by the replication engine.
#[derive(Debug, Error)]
pub enum CanalError {
    /// The table is filtered out. A control-flow signal, not a fault.
    #[error("table {schema}.{table} is excluded by the table filter")]
    ExcludedTable { schema: String, table: String },

    #[error("table {schema}.{table} not found")]
    TableNotFound { schema: String, table: String },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("no data received from the binlog stream for {0:?}")]
    StreamTimeout(Duration),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("timed out waiting for position {target} (reached {current})")]
    SyncTimeout { target: Position, current: Position },

    #[error("timed out after {0:?} waiting for the source head position")]
    HeadTimeout(Duration),

    #[error("engine closed")]
    Closed,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine cannot run from state {0}")]
    InvalidState(EngineState),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("mysql error: {0}")]
    MySql(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] rowtide_config::ConfigError),
}

impl CanalError {
    pub fn excluded(schema: &str, table: &str) -> Self {
        CanalError::ExcludedTable {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn not_found(schema: &str, table: &str) -> Self {
        CanalError::TableNotFound {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn is_excluded_table(&self) -> bool {
        matches!(self, CanalError::ExcludedTable { .. })
    }

    pub fn is_table_not_found(&self) -> bool {
        matches!(self, CanalError::TableNotFound { .. })
    }

    pub fn is_stream_timeout(&self) -> bool {
        matches!(self, CanalError::StreamTimeout(_))
    }

    /// Either wait of `catch_position` ran out of time.
    pub fn is_sync_timeout(&self) -> bool {
        matches!(
            self,
            CanalError::SyncTimeout { .. } | CanalError::HeadTimeout(_)
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CanalError::Closed)
    }
}

impl From<mysql_async::Error> for CanalError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Server(err) => CanalError::Server {
                code: err.code,
                message: err.message,
            },
            other => CanalError::MySql(other.to_string()),
        }
    }
}

pub type CanalResult<T> = Result<T, CanalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_excluded_table_survives_context() {
        let result: CanalResult<()> = Err(CanalError::excluded("mysql", "user"));
        let err = result.context("looking up mysql.user").unwrap_err();

        let inner = err.downcast_ref::<CanalError>().unwrap();
        assert!(inner.is_excluded_table());
        assert!(!inner.is_table_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = CanalError::SyncTimeout {
            target: Position::new("mysql-bin.000002", 500),
            current: Position::new("mysql-bin.000002", 120),
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for position mysql-bin.000002:500 (reached mysql-bin.000002:120)"
        );

        let err = CanalError::from(DecodeError::Unsupported(40));
        assert_eq!(
            err.to_string(),
            "decode error: unsupported binlog event type 40 (0x28)"
        );
    }
}
