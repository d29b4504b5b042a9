//! Error types for Savor.

use thiserror::Error;

/// Result type alias for Savor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared across the Savor crates.
///
/// Variants name where a failure surfaces in the pipeline rather than how
/// it happened: the components decide between retry, redelivery, and exit
/// based on which seam broke.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level trouble reaching Postgres, the bus, or the model
    /// server. Transient; recovered by reconnect or redelivery.
    #[error("network error: {0}")]
    Network(String),

    /// The database rejected a query or reported a server-side problem.
    #[error("database error: {0}")]
    Database(String),

    /// A malformed or unexpected frame on the replication wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JetStream publish, fetch, or acknowledgement failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// The model server failed or returned an unusable response.
    #[error("model error: {0}")]
    Model(String),

    /// A payload that would not encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A missing or contradictory configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A row, slot, or stream that was expected to exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied data that failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A broken invariant inside the pipeline itself.
    #[error("internal error: {0}")]
    Internal(String),

    /// Plain I/O failure, passed through unchanged.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything bubbling up from utility code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
