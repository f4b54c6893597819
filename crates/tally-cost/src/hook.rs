//! Stop-hook payload handling.
//!
//! Claude Code runs the hook once per completed turn and passes a small JSON
//! object on stdin. Only `session_id` and `transcript_path` matter here; any
//! other fields are ignored.

use crate::error::{CostError, Result};
use crate::scanner::LogScanner;
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

/// JSON payload delivered to the hook on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
}

/// What a hook invocation should ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTarget {
    /// A single session log
    File(PathBuf),
    /// Every log under the root
    All,
}

impl HookPayload {
    /// Parse a payload. Blank input is an empty payload.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    /// Read and parse a payload from a reader (normally stdin).
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(|e| CostError::file_access("<stdin>", e))?;
        Self::from_json(&raw)
    }

    /// Pick the file to ingest: the transcript path if it exists, then
    /// `<session_id>.jsonl` under the root, then everything.
    pub fn resolve_target(&self, scanner: &LogScanner) -> HookTarget {
        if let Some(path) = &self.transcript_path
            && path.is_file()
        {
            return HookTarget::File(path.clone());
        }

        if let Some(session_id) = self.session_id.as_deref().filter(|s| !s.is_empty())
            && let Some(path) = scanner.find_session(session_id)
        {
            debug!(session_id, file = %path.display(), "Resolved session log by id");
            return HookTarget::File(path);
        }

        debug!("Hook payload did not identify a log, scanning everything");
        HookTarget::All
    }
}
