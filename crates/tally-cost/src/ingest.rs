//! Ingestion engine: scan, parse, price, deduplicate, commit.
//!
//! Each file is processed independently. Its unread range is parsed into
//! turns, repeated identity keys inside the range are collapsed, and the
//! turns are committed together with the new cursor in one transaction. A
//! crash before the commit leaves the cursor where it was; the next run reads
//! the same range again and the identity-key constraint drops what was
//! already stored.
//!
//! A message is written as several streaming records sharing one identity
//! key, and only the last of them carries the final counts. When a range
//! ends in such a run and the file is still being written, the run is left
//! uncommitted and the cursor stops at its first byte, so the next read sees
//! the whole message.

use crate::db::{CommitBatch, UsageStore};
use crate::error::Result;
use crate::hook::{HookPayload, HookTarget};
use crate::models::Turn;
use crate::parser::{ParseError, ParsedLine, RecordParser, TurnCandidate};
use crate::pricing::PricingTable;
use crate::scanner::{LogScanner, PendingRange, project_hint};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_core::log_ingest_event;
use tracing::{debug, error, info, warn};

/// Project name used when a record has no `cwd` and the log has no parent.
const UNKNOWN_PROJECT: &str = "unknown";

/// How long a log must go unmodified before a trailing streaming run is
/// committed by a plain ingest.
pub const DEFAULT_SETTLE_AFTER: Duration = Duration::from_secs(120);

/// Outcome of ingesting one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub source_file: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub turns_parsed: usize,
    pub turns_inserted: usize,
    pub duplicates: usize,
    pub lines_skipped: usize,
    /// Trailing streaming records left for the next read
    pub turns_deferred: usize,
    pub unknown_models: BTreeSet<String>,
}

/// Totals across one ingestion invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_scanned: usize,
    pub turns_parsed: usize,
    pub turns_inserted: usize,
    pub duplicates: usize,
    pub lines_skipped: usize,
    pub turns_deferred: usize,
    pub unknown_model_warnings: usize,
    pub unknown_models: BTreeSet<String>,
    pub files_failed: usize,
}

impl IngestReport {
    fn add_file(&mut self, file: FileReport) {
        self.files_scanned += 1;
        self.turns_parsed += file.turns_parsed;
        self.turns_inserted += file.turns_inserted;
        self.duplicates += file.duplicates;
        self.lines_skipped += file.lines_skipped;
        self.turns_deferred += file.turns_deferred;
        self.unknown_model_warnings += file.unknown_models.len();
        self.unknown_models.extend(file.unknown_models);
    }

    fn add_failure(&mut self) {
        self.files_scanned += 1;
        self.files_failed += 1;
    }
}

impl From<FileReport> for IngestReport {
    fn from(file: FileReport) -> Self {
        let mut report = IngestReport::default();
        report.add_file(file);
        report
    }
}

/// Turns one file's pending range into stored turns.
pub struct IngestEngine<'a> {
    store: &'a UsageStore,
    scanner: LogScanner,
    parser: RecordParser,
    pricing: PricingTable,
    settle_after: Duration,
}

impl<'a> IngestEngine<'a> {
    pub fn new(store: &'a UsageStore, scanner: LogScanner, pricing: PricingTable) -> Self {
        Self {
            store,
            scanner,
            parser: RecordParser::new(),
            pricing,
            settle_after: DEFAULT_SETTLE_AFTER,
        }
    }

    /// Set how long a file must be idle before its trailing streaming run
    /// is committed. Zero commits every range in full.
    pub fn with_settle_after(mut self, settle_after: Duration) -> Self {
        self.settle_after = settle_after;
        self
    }

    /// Replace the pricing table. Turns already stored keep their cost.
    pub fn set_pricing(&mut self, pricing: PricingTable) {
        self.pricing = pricing;
    }

    /// Ingest whatever is new in one file since its committed cursor.
    pub fn ingest_file(&self, path: &Path) -> Result<FileReport> {
        self.ingest(path, false)
    }

    /// Ingest a file whose writer has finished, committing its trailing
    /// streaming run regardless of how recently it was modified.
    pub fn ingest_finished_file(&self, path: &Path) -> Result<FileReport> {
        self.ingest(path, true)
    }

    fn ingest(&self, path: &Path, finished: bool) -> Result<FileReport> {
        let source_file = path.to_string_lossy().into_owned();
        let cursor = self.store.cursor_offset(&source_file)?;

        let mut report = FileReport {
            source_file: source_file.clone(),
            start_offset: cursor,
            end_offset: cursor,
            ..Default::default()
        };

        let Some(range) = self.scanner.read_pending(path, cursor)? else {
            debug!(file = %source_file, cursor, "Nothing new to ingest");
            return Ok(report);
        };

        let settled = finished || self.is_settled(&range);
        let (turns, end_offset) = self.collect_turns(&range, settled, &mut report);
        if end_offset == range.start {
            debug!(
                file = %source_file,
                cursor,
                deferred = report.turns_deferred,
                "Only an unfinished message pending"
            );
            return Ok(report);
        }

        let batch = CommitBatch {
            source_file: source_file.clone(),
            end_offset,
            turns,
            skipped_lines: report.lines_skipped as i64,
        };
        let outcome = self.store.commit_batch(&batch)?;

        report.end_offset = end_offset;
        report.turns_inserted = outcome.inserted;
        report.duplicates = outcome.duplicates;

        log_ingest_event!(
            file = %source_file,
            start = range.start,
            end = end_offset,
            parsed = report.turns_parsed,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            skipped = report.lines_skipped,
            deferred = report.turns_deferred
        );

        Ok(report)
    }

    /// Whether the file has been idle long enough for its last message to
    /// be final. An unknown modification time counts as settled.
    fn is_settled(&self, range: &PendingRange) -> bool {
        if self.settle_after.is_zero() {
            return true;
        }
        match range.modified.and_then(|m| m.elapsed().ok()) {
            Some(age) => age >= self.settle_after,
            None => true,
        }
    }

    /// Parse, price and collapse the lines of a range.
    ///
    /// Returns the turns to commit and the offset the cursor may advance to.
    /// Streaming writes several records for one message; the one with the
    /// most output tokens is the final one. Every turn of a session is
    /// placed in the project of the first `cwd` the session names.
    fn collect_turns(
        &self,
        range: &PendingRange,
        settled: bool,
        report: &mut FileReport,
    ) -> (Vec<Turn>, u64) {
        let mut lines: Vec<(u64, std::result::Result<ParsedLine, ParseError>)> = Vec::new();
        let mut session_projects: HashMap<String, String> = HashMap::new();
        let mut first_cwd: Option<String> = None;

        for (offset, line) in range.lines() {
            let parsed = self.parser.parse_line(&line);
            if let Ok(record) = &parsed
                && let Some(cwd) = record.cwd()
            {
                if let Some(session) = record.session_id() {
                    session_projects
                        .entry(session.to_string())
                        .or_insert_with(|| cwd.to_string());
                }
                first_cwd.get_or_insert_with(|| cwd.to_string());
            }
            lines.push((offset, parsed));
        }

        let fallback_project = first_cwd
            .or_else(|| project_hint(&range.path))
            .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());

        let commit_len = if settled {
            lines.len()
        } else {
            trailing_run_start(&lines)
        };
        report.turns_deferred = lines.len() - commit_len;
        let end_offset = lines.get(commit_len).map_or(range.end, |(offset, _)| *offset);

        let mut turns: Vec<Turn> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for (offset, parsed) in lines.into_iter().take(commit_len) {
            let candidate = match parsed {
                Ok(ParsedLine::Turn(candidate)) => candidate,
                Ok(ParsedLine::Other { .. }) => continue,
                Err(e) => {
                    report.lines_skipped += 1;
                    warn!(file = %report.source_file, offset, error = %e, "Skipping malformed line");
                    continue;
                }
            };
            report.turns_parsed += 1;

            let project = session_projects
                .get(&candidate.session_id)
                .unwrap_or(&fallback_project)
                .clone();
            let turn = self.build_turn(candidate, &report.source_file, offset, project);
            if turn.priced_by_fallback && report.unknown_models.insert(turn.model.clone()) {
                warn!(file = %report.source_file, model = %turn.model, "Unknown model, applied fallback pricing");
            }

            match by_key.get(&turn.id_key) {
                Some(&i) => {
                    if turn.tokens.output_tokens >= turns[i].tokens.output_tokens {
                        turns[i] = turn;
                    }
                }
                None => {
                    by_key.insert(turn.id_key.clone(), turns.len());
                    turns.push(turn);
                }
            }
        }

        (turns, end_offset)
    }

    fn build_turn(
        &self,
        candidate: TurnCandidate,
        source_file: &str,
        offset: u64,
        project_path: String,
    ) -> Turn {
        let priced = self.pricing.price(&candidate.model, &candidate.tokens);
        let id_key = candidate
            .identity_key
            .unwrap_or_else(|| format!("{}:{}", source_file, offset));

        Turn {
            id_key,
            session_id: candidate.session_id,
            project_path,
            model: candidate.model,
            timestamp: candidate.timestamp,
            tokens: candidate.tokens,
            cost_usd: priced.cost_usd,
            source_file: source_file.to_string(),
            source_offset: offset,
            priced_by_fallback: priced.warning.is_some(),
        }
    }

    /// Ingest every log under the root.
    ///
    /// A failing file is logged and counted; only errors that make the
    /// store itself untrustworthy stop the run.
    pub fn backfill(&self) -> Result<IngestReport> {
        let files = self.scanner.discover();
        info!(root = %self.scanner.root().display(), files = files.len(), "Starting backfill");
        self.ingest_files(files)
    }

    /// Ingest each of `paths`, counting per-file failures and stopping only
    /// on a fatal storage error.
    pub fn ingest_files(&self, paths: impl IntoIterator<Item = PathBuf>) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for path in paths {
            match self.ingest_file(&path) {
                Ok(file) => report.add_file(file),
                Err(e) if e.is_fatal() => {
                    error!(file = %path.display(), error = %e, "Fatal storage error, aborting backfill");
                    return Err(e);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to ingest file, skipping");
                    report.add_failure();
                }
            }
        }

        info!(
            files = report.files_scanned,
            inserted = report.turns_inserted,
            duplicates = report.duplicates,
            skipped = report.lines_skipped,
            deferred = report.turns_deferred,
            failed = report.files_failed,
            "Ingest complete"
        );
        Ok(report)
    }

    /// Handle one hook trigger. Never fails; problems are logged and show up
    /// as `files_failed` in the report.
    pub fn run_hook(&self, payload: &HookPayload) -> IngestReport {
        match payload.resolve_target(&self.scanner) {
            // Stop fires once the response is written, so nothing is in flight
            HookTarget::File(path) => match self.ingest_finished_file(&path) {
                Ok(file) => file.into(),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Hook ingestion failed");
                    let mut report = IngestReport::default();
                    report.add_failure();
                    report
                }
            },
            HookTarget::All => match self.backfill() {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Hook backfill failed");
                    let mut report = IngestReport::default();
                    report.add_failure();
                    report
                }
            },
        }
    }

    /// Forget a file's cursor so the next ingest re-reads it from the start.
    /// Already stored turns are deduplicated, so this is safe to repeat.
    pub fn reset_cursor(&self, path: &Path) -> Result<bool> {
        let source_file = path.to_string_lossy();
        let removed = self.store.reset_cursor(&source_file)?;
        info!(file = %source_file, removed, "Reset ingest cursor");
        Ok(removed)
    }

    /// Forget every cursor.
    pub fn reset_all_cursors(&self) -> Result<usize> {
        let removed = self.store.reset_all_cursors()?;
        info!(removed, "Reset all ingest cursors");
        Ok(removed)
    }
}

/// Index of the first line of the trailing run of turns that share the
/// last turn's identity key, or `lines.len()` when the range does not end
/// in a keyed turn.
fn trailing_run_start(lines: &[(u64, std::result::Result<ParsedLine, ParseError>)]) -> usize {
    let Some((_, Ok(ParsedLine::Turn(last)))) = lines.last() else {
        return lines.len();
    };
    let Some(key) = last.identity_key.as_deref() else {
        return lines.len();
    };
    let run = lines
        .iter()
        .rev()
        .take_while(|(_, parsed)| {
            matches!(parsed, Ok(ParsedLine::Turn(t)) if t.identity_key.as_deref() == Some(key))
        })
        .count();
    lines.len() - run
}
