//! Common error types for the offline sync engine.

use thiserror::Error;

/// Top-level error type for offline engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store operation failed (open, query, write, closed handle).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote call failed at the transport level.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The engine or store was used before `initialize` or after `cleanup`.
    #[error("Not initialized: {0}")]
    NotInitialized(String),
}

impl Error {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("refused".into()).is_transient());
        assert!(Error::Timeout("10s".into()).is_transient());
        assert!(!Error::Storage("disk full".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
