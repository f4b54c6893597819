//! Error types for ingestion, storage and queries.
//!
//! Failures are classified by blast radius:
//! - [`CostError::FileAccess`] affects one log file; the engine skips it.
//! - [`CostError::StorageContention`] is transient; the invocation gives up
//!   and the next hook trigger picks up from the committed cursor.
//! - [`CostError::Schema`] means the store cannot be trusted and is fatal.
//!
//! Per-line parse failures are [`crate::parser::ParseError`] and never
//! surface as a `CostError`.

use std::path::PathBuf;
use thiserror::Error;

/// Cost tracking errors.
#[derive(Error, Debug)]
pub enum CostError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database stayed locked through every retry
    #[error("database is locked during {operation} (gave up after {attempts} attempts): {message}")]
    StorageContention {
        /// Operation that was being attempted
        operation: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last SQLite message
        message: String,
    },

    /// Persisted store is missing expected structure
    #[error("schema error: {0}")]
    Schema(String),

    /// A log file could not be read
    #[error("cannot read {path}: {source}")]
    FileAccess {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing error (hook payloads)
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking holder
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl CostError {
    /// Wrap an I/O error with the file it came from.
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CostError::FileAccess {
            path: path.into(),
            source,
        }
    }

    /// Check if this error is retryable (e.g., database locked).
    pub fn is_retryable(&self) -> bool {
        is_database_locked_error(self)
    }

    /// Errors that must abort the whole invocation rather than one file.
    pub fn is_fatal(&self) -> bool {
        match self {
            CostError::Schema(_) | CostError::StoreUnavailable(_) => true,
            CostError::Database(e) => !is_busy(e),
            _ => false,
        }
    }

    /// Create a user-friendly message for this error.
    pub fn friendly_message(&self) -> String {
        match self {
            CostError::StorageContention { attempts, .. } => {
                format!(
                    "Usage database is busy (gave up after {} attempts). The next update will catch up.",
                    attempts
                )
            }
            CostError::Schema(msg) => {
                format!(
                    "Usage database is damaged ({}). Delete it and run 'tally backfill'.",
                    msg
                )
            }
            CostError::FileAccess { path, source } => {
                let msg = source.to_string().to_lowercase();
                if msg.contains("permission") {
                    format!("Permission denied reading {}", path.display())
                } else if msg.contains("not found") || msg.contains("no such file") {
                    format!("Log file not found: {}", path.display())
                } else {
                    format!("Could not read {}: {}", path.display(), source)
                }
            }
            _ => self.to_string(),
        }
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
        }
        _ => false,
    }
}

/// Check if a CostError indicates a database lock.
pub fn is_database_locked_error(error: &CostError) -> bool {
    match error {
        CostError::StorageContention { .. } => true,
        CostError::Database(e) => is_busy(e),
        _ => false,
    }
}

/// Result type for cost tracking operations.
pub type Result<T> = std::result::Result<T, CostError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
    }

    #[test]
    fn test_busy_is_retryable_not_fatal() {
        let err = CostError::Database(busy());
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_schema_is_fatal() {
        let err = CostError::Schema("missing table turns".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.friendly_message().contains("backfill"));
    }

    #[test]
    fn test_file_access_is_isolated() {
        let err = CostError::file_access(
            "/nope/session.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        );
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.friendly_message().contains("not found"));
    }
}
