//! Error types shared by the tally crates.
//!
//! [`TallyError`] covers everything outside the ingestion engine itself:
//! configuration loading, filesystem setup, and logging initialization.
//! Engine and storage failures live in `tally_cost::CostError`.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`TallyError`].
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors raised while setting up a tally invocation.
#[derive(Debug, Error)]
pub enum TallyError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file exists but is not valid YAML for the schema
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration parsed but holds values that cannot be used
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    /// Configuration could not be serialized for saving
    #[error("Failed to serialize configuration: {message}")]
    ConfigSerialize { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No home directory could be resolved for default paths
    #[error("Could not determine the home directory")]
    HomeDirUnavailable,

    // =========================================================================
    // Logging Errors
    // =========================================================================
    /// A global tracing subscriber was already installed
    #[error("Failed to initialize logging: {message}")]
    LoggingInit { message: String },
}

impl TallyError {
    /// Create an I/O error
    pub fn io(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a config validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid { .. } | Self::ConfigValidation { .. } | Self::ConfigSerialize { .. }
        )
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => {
                Some("Check YAML syntax in ~/.tally/config.yaml or point TALLY_CONFIG elsewhere")
            }
            Self::ConfigValidation { .. } => Some("Fix the reported value in the configuration file"),
            Self::HomeDirUnavailable => Some("Set HOME or pass explicit paths on the command line"),
            Self::DirectoryCreation { .. } => Some("Check permissions on the parent directory"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_error() {
        let err = TallyError::ConfigInvalid {
            path: "/home/user/.tally/config.yaml".into(),
            message: "expected a mapping".into(),
        };
        assert!(err.to_string().contains("Invalid configuration"));
        assert!(err.is_config_error());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_io_error_is_not_config() {
        let err = TallyError::io(
            "reading",
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/x"));
        assert!(!err.is_config_error());
        assert!(err.guidance().is_none());
    }
}
