//! Error types for stratum.

use thiserror::Error;

/// Result type alias using stratum's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for stratum operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Reasoning service call failed (transient: network, timeout, rate limit)
    #[error("Reasoning error: {0}")]
    Reasoning(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Schema migration failure. Structural: callers abort rather than continue.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// True for error classes that indicate a broken store or schema,
    /// where the daemon must abort instead of retrying.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Migration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("element f_ab12".to_string());
        assert_eq!(err.to_string(), "Not found: element f_ab12");
    }

    #[test]
    fn test_error_display_reasoning() {
        let err = Error::Reasoning("backend timed out".to_string());
        assert_eq!(err.to_string(), "Reasoning error: backend timed out");
    }

    #[test]
    fn test_error_display_migration() {
        let err = Error::Migration("schema_version missing".to_string());
        assert_eq!(err.to_string(), "Migration error: schema_version missing");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_structural() {
        assert!(Error::Migration("x".into()).is_structural());
        assert!(!Error::Reasoning("x".into()).is_structural());
        assert!(!Error::Job("x".into()).is_structural());
    }
}
