//! Error types for the `ssemux` core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `ssemux` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload was null or missing
    #[error("Invalid empty source")]
    EmptySource,

    /// Payload kind cannot be framed (e.g. a callable)
    #[error("Invalid source type: {kind:?}")]
    UnsupportedSource { kind: String },

    /// The output channel rejected a write
    #[error("Write failed: {0}")]
    WriteFailure(String),

    /// An externally supplied byte source errored mid-drain
    #[error("Drain failed: {0}")]
    DrainFailure(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
