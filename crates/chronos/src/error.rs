//! Error types for chronos.
//!
//! Capability gaps and unmatched stops are recovered locally through boolean
//! returns; only the conditions below ever reach the caller.

use thiserror::Error;

/// Result type alias for chronos operations.
pub type Result<T> = std::result::Result<T, ChronosError>;

/// Errors surfaced by a [`Chronos`](crate::Chronos) instance.
#[derive(Debug, Error)]
pub enum ChronosError {
    /// A flush was requested but no sink is configured.
    #[error("Missing storing method: configure a sink before saving measures")]
    MissingSink,

    /// The configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while loading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for ChronosError {
    fn from(e: toml::de::Error) -> Self {
        ChronosError::Config(e.to_string())
    }
}

/// Errors a [`Sink`](crate::Sink) may report while storing a record.
///
/// A sink error aborts the current idle slice. It is logged, never retried.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink refused the record.
    #[error("Record rejected: {0}")]
    Rejected(String),
}
