//! Logging infrastructure for tally.
//!
//! Structured logging via the `tracing` ecosystem. tally runs as a short-lived
//! process (often from a Claude Code hook), so every invocation appends to the
//! same daily-rolling JSON log and also writes a compact line to stderr.
//! Nothing is ever written to stdout from here: the hook caller owns stdout.
//!
//! ## Example
//!
//! ```no_run
//! use tally_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("tally started");
//! tracing::debug!(file = "session.jsonl", offset = 0u64, "scanning");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Result, TallyError};

/// Guard that must be held to ensure log flushing on shutdown.
///
/// Keep this alive for the lifetime of the process; dropping it flushes the
/// non-blocking file writer.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the tally logging system.
///
/// This sets up:
/// - File logging to `<log_dir>/tally.log` (JSON lines, rotated daily)
/// - Console logging to stderr (human-readable format)
///
/// `log_dir` defaults to `~/.tally/logs/`. `verbose` raises the default level
/// from INFO to DEBUG; `RUST_LOG` overrides both.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| TallyError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "tally.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tally={default_level}")));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| TallyError::LoggingInit {
            message: e.to_string(),
        })?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Root directory for tally's own state.
///
/// Returns `~/.tally/`
pub fn tally_home() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".tally"))
        .ok_or(TallyError::HomeDirUnavailable)
}

/// Get the default log directory path.
///
/// Returns `~/.tally/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(tally_home()?.join("logs"))
}

/// Get the default tally log file path.
///
/// Returns `~/.tally/logs/tally.log`
pub fn default_log_file() -> Result<PathBuf> {
    Ok(default_log_dir()?.join("tally.log"))
}

/// Log the outcome of committing one source file.
///
/// # Example
///
/// ```ignore
/// log_ingest_event!(file = %path.display(), inserted = 3, duplicates = 0);
/// ```
#[macro_export]
macro_rules! log_ingest_event {
    ($($field:tt)*) => {
        tracing::info!(
            target: "tally::ingest",
            $($field)*,
            "ingest event"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_default_log_dir() {
        // SAFETY: serialized with every other test that touches HOME
        unsafe { std::env::set_var("HOME", "/tmp/test-home") };
        let dir = default_log_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/test-home/.tally/logs"));
    }

    #[test]
    #[serial]
    fn test_default_log_file() {
        // SAFETY: serialized with every other test that touches HOME
        unsafe { std::env::set_var("HOME", "/tmp/test-home") };
        let file = default_log_file().unwrap();
        assert_eq!(file, PathBuf::from("/tmp/test-home/.tally/logs/tally.log"));
    }

    #[test]
    fn test_init_test_logging() {
        init_test_logging();
        init_test_logging();
    }
}
