use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error("read timeout ({read_timeout_ms}ms) must exceed heartbeat period ({heartbeat_period_ms}ms)")]
    TimeoutTooShort {
        read_timeout_ms: u64,
        heartbeat_period_ms: u64,
    },

    #[error("invalid table pattern: {0}")]
    InvalidPattern(#[from] rowtide_core::Error),

    #[error("dump.tables and dump.databases are mutually exclusive")]
    ConflictingDumpSelection,

    #[error("invalid ignore table '{0}': expected db.table")]
    InvalidIgnoreTable(String),

    #[error("server_id must be non-zero")]
    InvalidServerId,

    #[error("{} configuration errors: {}", .0.len(), join_errors(.0))]
    Invalid(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ConfigResult<T> = Result<T, ConfigError>;
