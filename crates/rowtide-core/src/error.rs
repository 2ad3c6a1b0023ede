use thiserror::Error;

/// Errors that can occur in rowtide-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid table pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid position '{0}': expected <file>:<offset>")]
    InvalidPosition(String),

    #[error("invalid column type: {0}")]
    InvalidColumnType(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
