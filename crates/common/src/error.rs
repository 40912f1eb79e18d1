//! Error types shared across the FieldOps harness crates

use thiserror::Error;

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown entity category: {0}")]
    UnknownCategory(String),

    #[error("Unknown test mode: {0}")]
    UnknownMode(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl Error {
    /// Whether the failure is worth another attempt.
    ///
    /// SQLite reports contention as `SQLITE_BUSY`/`SQLITE_LOCKED`; both clear
    /// up once the other writer finishes.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeouts_are_transient() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk"));
        assert!(err.is_transient());

        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_errors_are_not_transient() {
        assert!(!Error::UnknownCategory("invoices".into()).is_transient());
        assert!(!Error::UnknownMode("staging".into()).is_transient());
    }
}
