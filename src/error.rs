//! chain-query error types

use std::fmt::Display;

use crate::key::QueryKey;

/// Errors surfaced by the query cache.
///
/// `Clone` because a single producer failure is delivered to every
/// consumer attached to the failing entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    // Pipeline errors
    /// The producer's stream terminated with an error.
    #[error("producer error: {0}")]
    Producer(String),

    #[error("query completed without emitting a value")]
    Completed,

    #[error("query cache closed")]
    Closed,

    /// Attaching spawns the pipeline, which needs a tokio runtime.
    #[error("no tokio runtime available to drive the query")]
    NoRuntime,

    // Misuse errors
    #[error("invalid query options: {0}")]
    InvalidOptions(String),

    /// The key is already cached with a different value type.
    #[error("key {key} is cached with a different value type")]
    TypeMismatch { key: QueryKey },

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl QueryError {
    /// Wrap an error from an external collaborator (RPC client, indexer,
    /// websocket) as a producer failure.
    pub fn producer(err: impl Display) -> Self {
        QueryError::Producer(err.to_string())
    }

    /// Whether the error came from the producer rather than from misuse.
    ///
    /// Producer failures are recoverable by acquiring the query again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Producer(_) | QueryError::Closed)
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::InvalidOptions(format!("unserializable key part: {err}"))
    }
}

/// Result type alias for chain-query operations
pub type Result<T> = std::result::Result<T, QueryError>;
