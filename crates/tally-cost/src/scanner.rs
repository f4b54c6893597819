//! Log discovery and incremental reads.
//!
//! The scanner never writes to source logs. It hands out only complete,
//! newline-terminated lines; a trailing partial line is left for the next
//! scan, so a file that is still being appended to is safe to read.

use crate::error::{CostError, Result};
use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Finds session logs under a root directory.
#[derive(Debug, Clone)]
pub struct LogScanner {
    root: PathBuf,
}

/// The unread, complete-line portion of one log file.
#[derive(Debug, Clone)]
pub struct PendingRange {
    pub path: PathBuf,
    /// Committed cursor the range starts at
    pub start: u64,
    /// Offset just past the last complete line
    pub end: u64,
    /// Last modification time of the file when it was read
    pub modified: Option<SystemTime>,
    data: Vec<u8>,
}

impl PendingRange {
    /// Lines in the range with their absolute byte offsets.
    pub fn lines(&self) -> impl Iterator<Item = (u64, Cow<'_, str>)> + '_ {
        let mut offset = self.start;
        self.data
            .split_inclusive(|b| *b == b'\n')
            .map(move |chunk| {
                let at = offset;
                offset += chunk.len() as u64;
                let mut line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
                line = line.strip_suffix(b"\r").unwrap_or(line);
                (at, String::from_utf8_lossy(line))
            })
    }
}

impl LogScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All `*.jsonl` files under the root, sorted. A missing root yields none.
    pub fn discover(&self) -> Vec<PathBuf> {
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "Log root does not exist");
            return Vec::new();
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_session_log(p))
            .collect();
        files.sort();
        files
    }

    /// Locate `<session_id>.jsonl` anywhere under the root.
    pub fn find_session(&self, session_id: &str) -> Option<PathBuf> {
        let wanted = format!("{session_id}.jsonl");
        self.discover()
            .into_iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(wanted.as_str()))
    }

    /// Read everything after `cursor` up to the last newline.
    ///
    /// Returns `Ok(None)` when there is nothing complete to read, or when the
    /// file is shorter than the cursor (truncated or replaced). The latter is
    /// logged and left for an explicit cursor reset.
    pub fn read_pending(&self, path: &Path, cursor: u64) -> Result<Option<PendingRange>> {
        let mut file = File::open(path).map_err(|e| CostError::file_access(path, e))?;
        let metadata = file
            .metadata()
            .map_err(|e| CostError::file_access(path, e))?;
        let len = metadata.len();

        if len < cursor {
            warn!(
                file = %path.display(),
                cursor,
                len,
                "Log file is shorter than its cursor, skipping until the cursor is reset"
            );
            return Ok(None);
        }
        if len == cursor {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(cursor))
            .map_err(|e| CostError::file_access(path, e))?;
        let mut data = Vec::with_capacity((len - cursor) as usize);
        // Bytes appended after the metadata call are left for the next scan
        file.take(len - cursor)
            .read_to_end(&mut data)
            .map_err(|e| CostError::file_access(path, e))?;

        let Some(last_newline) = data.iter().rposition(|b| *b == b'\n') else {
            debug!(file = %path.display(), cursor, "Only a partial line pending");
            return Ok(None);
        };
        data.truncate(last_newline + 1);

        Ok(Some(PendingRange {
            path: path.to_path_buf(),
            start: cursor,
            end: cursor + data.len() as u64,
            modified: metadata.modified().ok(),
            data,
        }))
    }
}

fn is_session_log(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("jsonl")
}

/// Project name implied by a log's location (its parent directory).
pub fn project_hint(path: &Path) -> Option<String> {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_discover_recurses_and_sorts() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("-home-dev-beta");
        let b = dir.path().join("-home-dev-alpha").join("nested");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("s2.jsonl"), "").unwrap();
        fs::write(b.join("s1.jsonl"), "").unwrap();
        fs::write(a.join("notes.txt"), "").unwrap();

        let scanner = LogScanner::new(dir.path());
        let files = scanner.discover();

        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("-home-dev-alpha/nested/s1.jsonl"));
        assert!(files[1].ends_with("-home-dev-beta/s2.jsonl"));
        assert_eq!(scanner.find_session("s2"), Some(a.join("s2.jsonl")));
        assert_eq!(scanner.find_session("missing"), None);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let scanner = LogScanner::new("/definitely/not/here");
        assert!(scanner.discover().is_empty());
    }

    #[test]
    fn test_partial_line_deferred() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(&path, "{\"a\":1}\n{\"b\":2}\n{\"c\":").unwrap();

        let scanner = LogScanner::new(dir.path());
        let range = scanner.read_pending(&path, 0).unwrap().unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 16);

        let lines: Vec<_> = range.lines().map(|(o, l)| (o, l.into_owned())).collect();
        assert_eq!(
            lines,
            vec![(0, "{\"a\":1}".to_string()), (8, "{\"b\":2}".to_string())]
        );

        // Nothing complete after the cursor yet
        assert!(scanner.read_pending(&path, range.end).unwrap().is_none());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"3}\n").unwrap();
        let range = scanner.read_pending(&path, 16).unwrap().unwrap();
        let lines: Vec<_> = range.lines().map(|(o, l)| (o, l.into_owned())).collect();
        assert_eq!(lines, vec![(16, "{\"c\":3}".to_string())]);
    }

    #[test]
    fn test_crlf_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(&path, "one\r\ntwo\n").unwrap();

        let range = LogScanner::new(dir.path())
            .read_pending(&path, 0)
            .unwrap()
            .unwrap();
        let lines: Vec<_> = range.lines().map(|(o, l)| (o, l.into_owned())).collect();
        assert_eq!(lines, vec![(0, "one".to_string()), (5, "two".to_string())]);
    }

    #[test]
    fn test_truncated_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(&path, "short\n").unwrap();

        let scanner = LogScanner::new(dir.path());
        assert!(scanner.read_pending(&path, 1_000).unwrap().is_none());
    }

    #[test]
    fn test_missing_file_is_file_access_error() {
        let scanner = LogScanner::new("/tmp");
        let err = scanner
            .read_pending(Path::new("/definitely/not/here.jsonl"), 0)
            .unwrap_err();
        assert!(matches!(err, CostError::FileAccess { .. }));
    }

    #[test]
    fn test_project_hint() {
        assert_eq!(
            project_hint(Path::new("/root/.claude/projects/-home-dev-webapp/abc.jsonl")),
            Some("-home-dev-webapp".to_string())
        );
    }
}
