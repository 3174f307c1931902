//! Unified error types for vetcache.
//!
//! Display strings carry a stable code prefix so the approval workflow can
//! branch on them without parsing free text.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

/// Unified error types for the store, the mutation pipeline and the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty value, unknown key).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// No entry or candidate found.
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("STORE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Stored data could not be decoded.
    #[error("STORE_ERROR: corrupt row: {0}")]
    Corrupt(String),

    /// Commit raced with another writer; the caller must re-review.
    #[error("CONCURRENT_MODIFICATION: {key} expected version {expected}, found {actual}")]
    ConcurrentModification { key: String, expected: u64, actual: u64 },

    /// The single writer handle for this store was already handed out.
    #[error("WRITER_TAKEN: the mutation pipeline for this store is already open")]
    WriterTaken,

    /// The writer lock file could not be created or written.
    #[error("STORE_ERROR: writer lock: {0}")]
    WriterLock(#[source] std::io::Error),
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let (code, message) = match &err {
            Error::InvalidInput(msg) => (-32602, msg.clone()),
            Error::NotFound(msg) => (-32001, msg.clone()),
            Error::ConcurrentModification { .. } => (-32009, err.to_string()),
            Error::WriterTaken => (-32010, err.to_string()),
            Error::Database(e) => (-32002, e.to_string()),
            Error::WriterLock(e) => (-32002, e.to_string()),
            Error::MigrationFailed(msg) | Error::Corrupt(msg) => (-32002, msg.clone()),
        };

        McpError { code: ErrorCode(code), message: message.into(), data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound("cancel_order".to_string());
        assert!(err.to_string().contains("NOT_FOUND"));
        assert!(err.to_string().contains("cancel_order"));
    }

    #[test]
    fn test_conflict_display_carries_versions() {
        let err = Error::ConcurrentModification { key: "cancel_order".into(), expected: 2, actual: 3 };
        let text = err.to_string();
        assert!(text.starts_with("CONCURRENT_MODIFICATION"));
        assert!(text.contains("expected version 2"));
        assert!(text.contains("found 3"));
    }

    #[test]
    fn test_error_to_mcp_error() {
        let err = Error::ConcurrentModification { key: "k".into(), expected: 1, actual: 2 };
        let mcp_err: McpError = err.into();
        assert_eq!(mcp_err.code.0, -32009);
    }
}
