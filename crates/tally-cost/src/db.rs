//! SQLite aggregate store.
//!
//! Turns are stored once per identity key. Every inserted turn updates the
//! session, project, model and daily aggregates in the same transaction as
//! the insert and the cursor advance, so aggregates are never stale relative
//! to committed turns.

use crate::error::{CostError, Result, is_database_locked_error};
use crate::models::{IngestCursor, Turn};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::borrow::Cow;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Maximum retries for database lock errors.
const DB_LOCK_MAX_RETRIES: u32 = 5;

/// Initial delay for database lock retry (in milliseconds).
const DB_LOCK_INITIAL_DELAY_MS: u64 = 50;

/// Maximum delay for database lock retry.
const DB_LOCK_MAX_DELAY: Duration = Duration::from_secs(2);

/// Default time SQLite itself waits on a lock before reporting BUSY.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Tables every usable store must have.
const REQUIRED_TABLES: [&str; 10] = [
    "schema_version",
    "turns",
    "ingest_cursors",
    "session_aggregates",
    "session_models",
    "project_aggregates",
    "project_sessions",
    "model_aggregates",
    "daily_aggregates",
    "daily_sessions",
];

/// Turns and cursor position for one file, committed atomically.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub source_file: String,
    /// Cursor position after this batch
    pub end_offset: u64,
    pub turns: Vec<Turn>,
    /// Lines in the range that failed to parse
    pub skipped_lines: i64,
}

/// What a commit actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Handle to the usage database. Opened per invocation, closed on drop.
pub struct UsageStore {
    conn: Mutex<Connection>,
}

impl UsageStore {
    /// Open or create a usage database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with an explicit SQLite busy timeout.
    pub fn open_with<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CostError::file_access(parent, e))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };

        // Switching a fresh file to WAL takes an exclusive lock
        let mode: String = store.with_retry("enable WAL", || {
            let conn = store.lock()?;
            Ok(conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?)
        })?;
        debug!(db = %path.display(), journal_mode = %mode, "Opened usage database");

        store.migrate()?;
        store.verify_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        store.verify_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CostError::StoreUnavailable(format!("connection lock poisoned: {}", e)))
    }

    /// Execute a database operation with automatic retry on lock errors.
    ///
    /// Retries back off exponentially with jitter so that several hook
    /// invocations racing for the write lock spread out. Once retries are
    /// exhausted a lock error becomes [`CostError::StorageContention`].
    fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(DB_LOCK_INITIAL_DELAY_MS);

        loop {
            attempt += 1;

            match f() {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            attempt,
                            operation, "Database operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(ref e) if is_database_locked_error(e) && attempt <= DB_LOCK_MAX_RETRIES => {
                    let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
                    let wait = delay + Duration::from_millis(jitter_ms);
                    warn!(
                        attempt,
                        max_retries = DB_LOCK_MAX_RETRIES,
                        delay_ms = wait.as_millis(),
                        operation,
                        "Database locked, retrying with backoff"
                    );

                    std::thread::sleep(wait);

                    // Exponential backoff with cap
                    delay = std::cmp::min(delay * 2, DB_LOCK_MAX_DELAY);
                }
                Err(e) if is_database_locked_error(&e) => {
                    warn!(attempt, operation, error = %e, "Database still locked, giving up");
                    return Err(CostError::StorageContention {
                        operation: operation.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!(
                            attempt,
                            operation,
                            error = %e,
                            "Database operation failed after retries"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run `f` inside an immediate write transaction, retried on contention.
    ///
    /// Any error rolls the whole transaction back.
    pub fn write<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        self.with_retry(operation, || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run `f` against one consistent read snapshot.
    pub fn read<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        self.with_retry(operation, || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run database migrations.
    ///
    /// The version check and every migration share one immediate
    /// transaction, so processes opening a fresh database at the same time
    /// queue on the write lock and only the first one creates the schema.
    fn migrate(&self) -> Result<()> {
        self.write("migrate schema", |tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY
                )",
                [],
            )?;

            let current_version: i32 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?;

            if current_version > SCHEMA_VERSION {
                return Err(CostError::Schema(format!(
                    "database schema version {} is newer than supported version {}",
                    current_version, SCHEMA_VERSION
                )));
            }

            if current_version < SCHEMA_VERSION {
                info!(
                    current = current_version,
                    target = SCHEMA_VERSION,
                    "Running database migrations"
                );
                if current_version < 1 {
                    Self::migration_v1(tx)?;
                }
            }

            Ok(())
        })
    }

    /// Migration to version 1: initial schema.
    fn migration_v1(conn: &Connection) -> Result<()> {
        debug!("Running migration v1: initial schema");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS turns (
                id_key TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                project_path TEXT NOT NULL,
                model TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                day TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cache_write_tokens INTEGER NOT NULL,
                cache_read_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                source_file TEXT NOT NULL,
                source_offset INTEGER NOT NULL,
                priced_by_fallback INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_turns_timestamp ON turns(timestamp);

            CREATE TABLE IF NOT EXISTS ingest_cursors (
                source_file TEXT PRIMARY KEY,
                byte_offset INTEGER NOT NULL,
                skipped_lines INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_aggregates (
                session_id TEXT PRIMARY KEY,
                project_path TEXT NOT NULL,
                turn_count INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cache_write_tokens INTEGER NOT NULL,
                cache_read_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_aggregates_last_seen
                ON session_aggregates(last_seen);

            CREATE TABLE IF NOT EXISTS session_models (
                session_id TEXT NOT NULL,
                model TEXT NOT NULL,
                turn_count INTEGER NOT NULL,
                PRIMARY KEY (session_id, model)
            );

            CREATE TABLE IF NOT EXISTS project_aggregates (
                project_path TEXT PRIMARY KEY,
                session_count INTEGER NOT NULL,
                turn_count INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cache_write_tokens INTEGER NOT NULL,
                cache_read_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS project_sessions (
                project_path TEXT NOT NULL,
                session_id TEXT NOT NULL,
                PRIMARY KEY (project_path, session_id)
            );

            CREATE TABLE IF NOT EXISTS model_aggregates (
                model TEXT PRIMARY KEY,
                turn_count INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cache_write_tokens INTEGER NOT NULL,
                cache_read_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_aggregates (
                day TEXT PRIMARY KEY,
                session_count INTEGER NOT NULL,
                turn_count INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cache_write_tokens INTEGER NOT NULL,
                cache_read_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_sessions (
                day TEXT NOT NULL,
                session_id TEXT NOT NULL,
                PRIMARY KEY (day, session_id)
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
        )?;

        Ok(())
    }

    /// Fail if any table the store depends on is missing.
    fn verify_schema(&self) -> Result<()> {
        self.read("verify schema", |conn| {
            let mut stmt =
                conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
            for table in REQUIRED_TABLES {
                if !stmt.exists(params![table])? {
                    return Err(CostError::Schema(format!("missing table {}", table)));
                }
            }
            Ok(())
        })
    }

    /// Committed cursor for a source file.
    pub fn cursor(&self, source_file: &str) -> Result<Option<IngestCursor>> {
        self.read("read cursor", |conn| {
            conn.query_row(
                "SELECT source_file, byte_offset, skipped_lines, updated_at
                 FROM ingest_cursors WHERE source_file = ?1",
                params![source_file],
                |row| {
                    Ok(IngestCursor {
                        source_file: row.get(0)?,
                        byte_offset: row.get::<_, i64>(1)? as u64,
                        skipped_lines: row.get(2)?,
                        updated_at: parse_timestamp(&row.get::<_, String>(3)?, 3)?,
                    })
                },
            )
            .optional()
            .map_err(CostError::from)
        })
    }

    /// Committed byte offset for a source file, zero if never read.
    pub fn cursor_offset(&self, source_file: &str) -> Result<u64> {
        Ok(self
            .cursor(source_file)?
            .map(|c| c.byte_offset)
            .unwrap_or(0))
    }

    /// Forget the cursor for one file so it is re-read from the start.
    pub fn reset_cursor(&self, source_file: &str) -> Result<bool> {
        let removed = self.write("reset cursor", |tx| {
            Ok(tx.execute(
                "DELETE FROM ingest_cursors WHERE source_file = ?1",
                params![source_file],
            )?)
        })?;
        Ok(removed > 0)
    }

    /// Forget every cursor.
    pub fn reset_all_cursors(&self) -> Result<usize> {
        self.write("reset all cursors", |tx| {
            Ok(tx.execute("DELETE FROM ingest_cursors", [])?)
        })
    }

    /// Number of stored turns.
    pub fn turn_count(&self) -> Result<i64> {
        self.read("count turns", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?)
        })
    }

    /// Insert a file's turns, update aggregates for the ones that are new,
    /// and advance its cursor, all in one transaction.
    ///
    /// A turn for a session that is already stored takes that session's
    /// project, so a session never spans two projects. The cursor never
    /// moves backwards, so a slower concurrent ingest of the same file
    /// cannot undo a faster one.
    pub fn commit_batch(&self, batch: &CommitBatch) -> Result<CommitOutcome> {
        self.write("commit batch", |tx| {
            let mut outcome = CommitOutcome::default();

            for turn in &batch.turns {
                let turn = match stored_project(tx, &turn.session_id)? {
                    Some(project) if project != turn.project_path => Cow::Owned(Turn {
                        project_path: project,
                        ..turn.clone()
                    }),
                    _ => Cow::Borrowed(turn),
                };
                if insert_turn(tx, &turn)? {
                    apply_turn(tx, &turn)?;
                    outcome.inserted += 1;
                } else {
                    outcome.duplicates += 1;
                }
            }

            tx.execute(
                "INSERT INTO ingest_cursors (source_file, byte_offset, skipped_lines, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_file) DO UPDATE SET
                    skipped_lines = CASE WHEN excluded.byte_offset > byte_offset
                        THEN skipped_lines + excluded.skipped_lines
                        ELSE skipped_lines END,
                    byte_offset = MAX(byte_offset, excluded.byte_offset),
                    updated_at = excluded.updated_at",
                params![
                    batch.source_file,
                    batch.end_offset as i64,
                    batch.skipped_lines,
                    format_timestamp(&Utc::now()),
                ],
            )?;

            Ok(outcome)
        })
    }

    /// Recompute every aggregate table from the stored turns.
    ///
    /// Returns the number of turns aggregated.
    pub fn rebuild_aggregates(&self) -> Result<i64> {
        let turns = self.write("rebuild aggregates", |tx| {
            tx.execute_batch(
                "DELETE FROM session_aggregates;
                 DELETE FROM session_models;
                 DELETE FROM project_aggregates;
                 DELETE FROM project_sessions;
                 DELETE FROM model_aggregates;
                 DELETE FROM daily_aggregates;
                 DELETE FROM daily_sessions;

                 INSERT INTO session_aggregates
                    (session_id, project_path, turn_count, input_tokens, output_tokens,
                     cache_write_tokens, cache_read_tokens, cost_usd, first_seen, last_seen)
                 SELECT t.session_id,
                        (SELECT f.project_path FROM turns f
                         WHERE f.session_id = t.session_id ORDER BY f.rowid LIMIT 1),
                        COUNT(*), SUM(input_tokens), SUM(output_tokens),
                        SUM(cache_write_tokens), SUM(cache_read_tokens), SUM(cost_usd),
                        MIN(timestamp), MAX(timestamp)
                 FROM turns t GROUP BY t.session_id;

                 INSERT INTO session_models (session_id, model, turn_count)
                 SELECT session_id, model, COUNT(*) FROM turns GROUP BY session_id, model;

                 INSERT INTO project_aggregates
                    (project_path, session_count, turn_count, input_tokens, output_tokens,
                     cache_write_tokens, cache_read_tokens, cost_usd, first_seen, last_seen)
                 SELECT project_path, COUNT(DISTINCT session_id), COUNT(*),
                        SUM(input_tokens), SUM(output_tokens),
                        SUM(cache_write_tokens), SUM(cache_read_tokens), SUM(cost_usd),
                        MIN(timestamp), MAX(timestamp)
                 FROM turns GROUP BY project_path;

                 INSERT INTO project_sessions (project_path, session_id)
                 SELECT DISTINCT project_path, session_id FROM turns;

                 INSERT INTO model_aggregates
                    (model, turn_count, input_tokens, output_tokens,
                     cache_write_tokens, cache_read_tokens, cost_usd, first_seen, last_seen)
                 SELECT model, COUNT(*), SUM(input_tokens), SUM(output_tokens),
                        SUM(cache_write_tokens), SUM(cache_read_tokens), SUM(cost_usd),
                        MIN(timestamp), MAX(timestamp)
                 FROM turns GROUP BY model;

                 INSERT INTO daily_aggregates
                    (day, session_count, turn_count, input_tokens, output_tokens,
                     cache_write_tokens, cache_read_tokens, cost_usd)
                 SELECT day, COUNT(DISTINCT session_id), COUNT(*),
                        SUM(input_tokens), SUM(output_tokens),
                        SUM(cache_write_tokens), SUM(cache_read_tokens), SUM(cost_usd)
                 FROM turns GROUP BY day;

                 INSERT INTO daily_sessions (day, session_id)
                 SELECT DISTINCT day, session_id FROM turns;",
            )?;

            Ok(tx.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get::<_, i64>(0))?)
        })?;

        info!(turns, "Rebuilt aggregates");
        Ok(turns)
    }
}

/// Project recorded for a session, if the session is stored.
fn stored_project(tx: &Transaction<'_>, session_id: &str) -> Result<Option<String>> {
    Ok(tx
        .prepare_cached("SELECT project_path FROM session_aggregates WHERE session_id = ?1")?
        .query_row(params![session_id], |row| row.get(0))
        .optional()?)
}

/// Insert a turn unless its identity key is already stored.
fn insert_turn(tx: &Transaction<'_>, turn: &Turn) -> Result<bool> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO turns
         (id_key, session_id, project_path, model, timestamp, day,
          input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
          cost_usd, source_file, source_offset, priced_by_fallback)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;

    let changed = stmt.execute(params![
        turn.id_key,
        turn.session_id,
        turn.project_path,
        turn.model,
        format_timestamp(&turn.timestamp),
        day_key(&turn.timestamp),
        turn.tokens.input_tokens,
        turn.tokens.output_tokens,
        turn.tokens.cache_write_tokens,
        turn.tokens.cache_read_tokens,
        turn.cost_usd,
        turn.source_file,
        turn.source_offset as i64,
        turn.priced_by_fallback,
    ])?;

    Ok(changed == 1)
}

/// Fold one newly inserted turn into every aggregate.
fn apply_turn(tx: &Transaction<'_>, turn: &Turn) -> Result<()> {
    let ts = format_timestamp(&turn.timestamp);
    let day = day_key(&turn.timestamp);
    let t = &turn.tokens;

    tx.prepare_cached(
        "INSERT INTO session_aggregates
         (session_id, project_path, turn_count, input_tokens, output_tokens,
          cache_write_tokens, cache_read_tokens, cost_usd, first_seen, last_seen)
         VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(session_id) DO UPDATE SET
            turn_count = turn_count + 1,
            input_tokens = input_tokens + excluded.input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cache_write_tokens = cache_write_tokens + excluded.cache_write_tokens,
            cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
            cost_usd = cost_usd + excluded.cost_usd,
            first_seen = MIN(first_seen, excluded.first_seen),
            last_seen = MAX(last_seen, excluded.last_seen)",
    )?
    .execute(params![
        turn.session_id,
        turn.project_path,
        t.input_tokens,
        t.output_tokens,
        t.cache_write_tokens,
        t.cache_read_tokens,
        turn.cost_usd,
        ts,
    ])?;

    tx.prepare_cached(
        "INSERT INTO session_models (session_id, model, turn_count) VALUES (?1, ?2, 1)
         ON CONFLICT(session_id, model) DO UPDATE SET turn_count = turn_count + 1",
    )?
    .execute(params![turn.session_id, turn.model])?;

    let new_project_session = tx
        .prepare_cached(
            "INSERT OR IGNORE INTO project_sessions (project_path, session_id) VALUES (?1, ?2)",
        )?
        .execute(params![turn.project_path, turn.session_id])?;

    tx.prepare_cached(
        "INSERT INTO project_aggregates
         (project_path, session_count, turn_count, input_tokens, output_tokens,
          cache_write_tokens, cache_read_tokens, cost_usd, first_seen, last_seen)
         VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(project_path) DO UPDATE SET
            session_count = session_count + excluded.session_count,
            turn_count = turn_count + 1,
            input_tokens = input_tokens + excluded.input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cache_write_tokens = cache_write_tokens + excluded.cache_write_tokens,
            cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
            cost_usd = cost_usd + excluded.cost_usd,
            first_seen = MIN(first_seen, excluded.first_seen),
            last_seen = MAX(last_seen, excluded.last_seen)",
    )?
    .execute(params![
        turn.project_path,
        new_project_session as i64,
        t.input_tokens,
        t.output_tokens,
        t.cache_write_tokens,
        t.cache_read_tokens,
        turn.cost_usd,
        ts,
    ])?;

    tx.prepare_cached(
        "INSERT INTO model_aggregates
         (model, turn_count, input_tokens, output_tokens,
          cache_write_tokens, cache_read_tokens, cost_usd, first_seen, last_seen)
         VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(model) DO UPDATE SET
            turn_count = turn_count + 1,
            input_tokens = input_tokens + excluded.input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cache_write_tokens = cache_write_tokens + excluded.cache_write_tokens,
            cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
            cost_usd = cost_usd + excluded.cost_usd,
            first_seen = MIN(first_seen, excluded.first_seen),
            last_seen = MAX(last_seen, excluded.last_seen)",
    )?
    .execute(params![
        turn.model,
        t.input_tokens,
        t.output_tokens,
        t.cache_write_tokens,
        t.cache_read_tokens,
        turn.cost_usd,
        ts,
    ])?;

    let new_daily_session = tx
        .prepare_cached("INSERT OR IGNORE INTO daily_sessions (day, session_id) VALUES (?1, ?2)")?
        .execute(params![day, turn.session_id])?;

    tx.prepare_cached(
        "INSERT INTO daily_aggregates
         (day, session_count, turn_count, input_tokens, output_tokens,
          cache_write_tokens, cache_read_tokens, cost_usd)
         VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(day) DO UPDATE SET
            session_count = session_count + excluded.session_count,
            turn_count = turn_count + 1,
            input_tokens = input_tokens + excluded.input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cache_write_tokens = cache_write_tokens + excluded.cache_write_tokens,
            cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
            cost_usd = cost_usd + excluded.cost_usd",
    )?
    .execute(params![
        day,
        new_daily_session as i64,
        t.input_tokens,
        t.output_tokens,
        t.cache_write_tokens,
        t.cache_read_tokens,
        turn.cost_usd,
    ])?;

    Ok(())
}

/// Fixed-width UTC timestamp, so text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// UTC calendar date used for daily grouping.
pub(crate) fn day_key(ts: &DateTime<Utc>) -> String {
    ts.date_naive().format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
