//! Read-only queries over the aggregate store.
//!
//! Every public method runs inside one read transaction, so it sees a single
//! committed snapshot. [`QueryService::snapshot`] gathers all dashboard views
//! inside one transaction. An empty store yields empty results.

use crate::db::{UsageStore, format_timestamp, parse_timestamp};
use crate::error::Result;
use crate::models::{
    DailySummary, DashboardSnapshot, ModelSummary, ProjectSummary, RateLimitStatus,
    SessionSummary, TokenCounts, Turn, UsageTotals, WindowUsage,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tally_config::Plan;

/// Sessions shown by default, most recent first.
pub const DEFAULT_SESSION_LIMIT: usize = 200;

/// Days covered by the default daily view.
pub const DEFAULT_DAILY_DAYS: u32 = 30;

/// Length of the usage window that plan limits apply to.
pub const RATE_LIMIT_WINDOW_HOURS: u32 = 5;

/// Query interface for usage analysis.
pub struct QueryService<'a> {
    store: &'a UsageStore,
}

impl<'a> QueryService<'a> {
    /// Create a new query interface.
    pub fn new(store: &'a UsageStore) -> Self {
        Self { store }
    }

    /// Sessions by last activity, newest first.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        self.store
            .read("list sessions", |conn| sessions(conn, limit))
    }

    /// Projects by total cost, highest first.
    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        self.store.read("list projects", projects)
    }

    /// Models by total cost, highest first.
    pub fn list_models(&self) -> Result<Vec<ModelSummary>> {
        self.store.read("list models", models)
    }

    /// Daily totals for the last `days` days, today included, oldest first.
    /// Days without usage are omitted.
    pub fn daily_totals(&self, days: u32) -> Result<Vec<DailySummary>> {
        self.daily_totals_ending(Utc::now().date_naive(), days)
    }

    /// Daily totals for the `days` days ending on `end`.
    pub fn daily_totals_ending(&self, end: NaiveDate, days: u32) -> Result<Vec<DailySummary>> {
        self.store
            .read("daily totals", |conn| daily(conn, end, days))
    }

    /// Every turn of one session, in time order.
    pub fn session_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        self.store
            .read("session turns", |conn| turns_for_session(conn, session_id))
    }

    /// All-time totals.
    pub fn totals(&self) -> Result<UsageTotals> {
        self.store.read("totals", totals)
    }

    /// Totals for the current UTC day.
    pub fn today(&self) -> Result<UsageTotals> {
        self.day_totals(Utc::now().date_naive())
    }

    /// Totals for one UTC day.
    pub fn day_totals(&self, date: NaiveDate) -> Result<UsageTotals> {
        self.store.read("day totals", |conn| day_totals(conn, date))
    }

    /// Usage over the trailing `hours`.
    pub fn rolling_window(&self, hours: u32) -> Result<WindowUsage> {
        self.rolling_window_at(Utc::now(), hours)
    }

    /// Usage over the `hours` before `now`.
    pub fn rolling_window_at(&self, now: DateTime<Utc>, hours: u32) -> Result<WindowUsage> {
        self.store
            .read("rolling window", |conn| window(conn, now, hours))
    }

    /// Output tokens in the trailing window against the plan allowance.
    pub fn rate_limit_status(&self, plan: Plan, hours: u32) -> Result<RateLimitStatus> {
        let window = self.rolling_window(hours)?;
        Ok(RateLimitStatus::from_window(plan, &window))
    }

    /// Every dashboard view, read from one snapshot.
    pub fn snapshot(&self, plan: Plan) -> Result<DashboardSnapshot> {
        self.snapshot_at(Utc::now(), plan)
    }

    /// Every dashboard view as of `now`, read from one snapshot.
    pub fn snapshot_at(&self, now: DateTime<Utc>, plan: Plan) -> Result<DashboardSnapshot> {
        self.store.read("snapshot", |conn| {
            let window = window(conn, now, RATE_LIMIT_WINDOW_HOURS)?;
            Ok(DashboardSnapshot {
                taken_at: now,
                totals: totals(conn)?,
                today: day_totals(conn, now.date_naive())?,
                rate_limit: RateLimitStatus::from_window(plan, &window),
                window,
                sessions: sessions(conn, DEFAULT_SESSION_LIMIT)?,
                projects: projects(conn)?,
                models: models(conn)?,
                daily: daily(conn, now.date_naive(), DEFAULT_DAILY_DAYS)?,
            })
        })
    }
}

/// Four token columns starting at `start`.
fn tokens_at(row: &Row<'_>, start: usize) -> rusqlite::Result<TokenCounts> {
    Ok(TokenCounts {
        input_tokens: row.get(start)?,
        output_tokens: row.get(start + 1)?,
        cache_write_tokens: row.get(start + 2)?,
        cache_read_tokens: row.get(start + 3)?,
    })
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(&row.get::<_, String>(idx)?, idx)
}

fn sessions(conn: &Connection, limit: usize) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, project_path, turn_count,
                input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                cost_usd, first_seen, last_seen
         FROM session_aggregates
         ORDER BY last_seen DESC, session_id
         LIMIT ?1",
    )?;
    let mut summaries = stmt
        .query_map(params![limit as i64], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                project_path: row.get(1)?,
                models: Vec::new(),
                turn_count: row.get(2)?,
                tokens: tokens_at(row, 3)?,
                cost_usd: row.get(7)?,
                first_seen: timestamp_at(row, 8)?,
                last_seen: timestamp_at(row, 9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut models_stmt = conn.prepare_cached(
        "SELECT model FROM session_models
         WHERE session_id = ?1
         ORDER BY turn_count DESC, model",
    )?;
    for summary in &mut summaries {
        summary.models = models_stmt
            .query_map(params![summary.session_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
    }

    Ok(summaries)
}

fn projects(conn: &Connection) -> Result<Vec<ProjectSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT project_path, session_count, turn_count,
                input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                cost_usd, first_seen, last_seen
         FROM project_aggregates
         ORDER BY cost_usd DESC, project_path",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProjectSummary {
                project_path: row.get(0)?,
                session_count: row.get(1)?,
                turn_count: row.get(2)?,
                tokens: tokens_at(row, 3)?,
                cost_usd: row.get(7)?,
                first_seen: timestamp_at(row, 8)?,
                last_seen: timestamp_at(row, 9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn models(conn: &Connection) -> Result<Vec<ModelSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT model, turn_count,
                input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                cost_usd, first_seen, last_seen
         FROM model_aggregates
         ORDER BY cost_usd DESC, model",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ModelSummary {
                model: row.get(0)?,
                turn_count: row.get(1)?,
                tokens: tokens_at(row, 2)?,
                cost_usd: row.get(6)?,
                first_seen: timestamp_at(row, 7)?,
                last_seen: timestamp_at(row, 8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn daily(conn: &Connection, end: NaiveDate, days: u32) -> Result<Vec<DailySummary>> {
    if days == 0 {
        return Ok(Vec::new());
    }
    let start = end - Duration::days(i64::from(days) - 1);

    let mut stmt = conn.prepare_cached(
        "SELECT day, session_count, turn_count,
                input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                cost_usd
         FROM daily_aggregates
         WHERE day BETWEEN ?1 AND ?2
         ORDER BY day ASC",
    )?;
    let rows = stmt
        .query_map(
            params![start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string()],
            |row| {
                let raw: String = row.get(0)?;
                let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                })?;
                Ok(DailySummary {
                    date,
                    session_count: row.get(1)?,
                    turn_count: row.get(2)?,
                    tokens: tokens_at(row, 3)?,
                    cost_usd: row.get(7)?,
                })
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn turns_for_session(conn: &Connection, session_id: &str) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id_key, session_id, project_path, model, timestamp,
                input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                cost_usd, source_file, source_offset, priced_by_fallback
         FROM turns
         WHERE session_id = ?1
         ORDER BY timestamp ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(Turn {
                id_key: row.get(0)?,
                session_id: row.get(1)?,
                project_path: row.get(2)?,
                model: row.get(3)?,
                timestamp: timestamp_at(row, 4)?,
                tokens: tokens_at(row, 5)?,
                cost_usd: row.get(9)?,
                source_file: row.get(10)?,
                source_offset: row.get::<_, i64>(11)? as u64,
                priced_by_fallback: row.get(12)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn totals(conn: &Connection) -> Result<UsageTotals> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(turn_count), 0),
                COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                COALESCE(SUM(cache_write_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                COALESCE(SUM(cost_usd), 0.0)
         FROM session_aggregates",
        [],
        |row| {
            Ok(UsageTotals {
                session_count: row.get(0)?,
                turn_count: row.get(1)?,
                tokens: tokens_at(row, 2)?,
                cost_usd: row.get(6)?,
            })
        },
    )?)
}

fn day_totals(conn: &Connection, date: NaiveDate) -> Result<UsageTotals> {
    let day = date.format("%Y-%m-%d").to_string();
    let totals = conn
        .query_row(
            "SELECT session_count, turn_count,
                    input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                    cost_usd
             FROM daily_aggregates WHERE day = ?1",
            params![day],
            |row| {
                Ok(UsageTotals {
                    session_count: row.get(0)?,
                    turn_count: row.get(1)?,
                    tokens: tokens_at(row, 2)?,
                    cost_usd: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(totals.unwrap_or_default())
}

fn window(conn: &Connection, now: DateTime<Utc>, hours: u32) -> Result<WindowUsage> {
    let since = now - Duration::hours(i64::from(hours));
    let (totals, oldest) = conn.query_row(
        "SELECT COUNT(DISTINCT session_id), COUNT(*),
                COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                COALESCE(SUM(cache_write_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                COALESCE(SUM(cost_usd), 0.0), MIN(timestamp)
         FROM turns
         WHERE timestamp >= ?1 AND timestamp <= ?2",
        params![format_timestamp(&since), format_timestamp(&now)],
        |row| {
            let totals = UsageTotals {
                session_count: row.get(0)?,
                turn_count: row.get(1)?,
                tokens: tokens_at(row, 2)?,
                cost_usd: row.get(6)?,
            };
            let oldest = match row.get::<_, Option<String>>(7)? {
                Some(raw) => Some(parse_timestamp(&raw, 7)?),
                None => None,
            };
            Ok((totals, oldest))
        },
    )?;

    Ok(WindowUsage {
        hours,
        totals,
        oldest_turn: oldest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CommitBatch;
    use chrono::TimeZone;

    fn turn(
        id: &str,
        session: &str,
        project: &str,
        model: &str,
        ts: DateTime<Utc>,
        output: i64,
        cost: f64,
    ) -> Turn {
        Turn {
            id_key: id.to_string(),
            session_id: session.to_string(),
            project_path: project.to_string(),
            model: model.to_string(),
            timestamp: ts,
            tokens: TokenCounts::new(10, output, 0, 0),
            cost_usd: cost,
            source_file: "/logs/a.jsonl".to_string(),
            source_offset: 0,
            priced_by_fallback: false,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn seeded() -> UsageStore {
        let store = UsageStore::open_in_memory().unwrap();
        store
            .commit_batch(&CommitBatch {
                source_file: "/logs/a.jsonl".to_string(),
                end_offset: 100,
                turns: vec![
                    turn("m1", "s1", "/p/alpha", "claude-sonnet-4-6", at(1, 9), 100, 0.50),
                    turn("m2", "s1", "/p/alpha", "claude-opus-4-6", at(1, 10), 200, 2.00),
                    turn("m3", "s2", "/p/beta", "claude-sonnet-4-6", at(2, 8), 300, 0.25),
                    turn("m4", "s3", "/p/alpha", "claude-haiku-4-5", at(3, 12), 50, 0.05),
                ],
                skipped_lines: 0,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let store = UsageStore::open_in_memory().unwrap();
        let q = QueryService::new(&store);

        assert!(q.list_sessions(10).unwrap().is_empty());
        assert!(q.list_projects().unwrap().is_empty());
        assert!(q.list_models().unwrap().is_empty());
        assert!(q.daily_totals(30).unwrap().is_empty());
        assert!(q.session_turns("nope").unwrap().is_empty());
        assert_eq!(q.totals().unwrap(), UsageTotals::default());
        assert_eq!(q.today().unwrap(), UsageTotals::default());

        let window = q.rolling_window(5).unwrap();
        assert_eq!(window.totals, UsageTotals::default());
        assert!(window.oldest_turn.is_none());

        let snap = q.snapshot(Plan::Pro).unwrap();
        assert!(snap.sessions.is_empty());
        assert_eq!(snap.rate_limit.used_output_tokens, 0);
    }

    #[test]
    fn test_sessions_by_last_activity() {
        let store = seeded();
        let sessions = QueryService::new(&store).list_sessions(10).unwrap();

        let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s2", "s1"]);

        let s1 = &sessions[2];
        assert_eq!(s1.turn_count, 2);
        assert_eq!(s1.tokens.output_tokens, 300);
        assert!((s1.cost_usd - 2.50).abs() < 1e-9);
        assert_eq!(s1.first_seen, at(1, 9));
        assert_eq!(s1.last_seen, at(1, 10));
        assert_eq!(s1.models.len(), 2);

        assert_eq!(QueryService::new(&store).list_sessions(1).unwrap().len(), 1);
    }

    #[test]
    fn test_projects_and_models_by_cost() {
        let store = seeded();
        let q = QueryService::new(&store);

        let projects = q.list_projects().unwrap();
        assert_eq!(projects[0].project_path, "/p/alpha");
        assert_eq!(projects[0].session_count, 2);
        assert_eq!(projects[0].turn_count, 3);
        assert!((projects[0].cost_usd - 2.55).abs() < 1e-9);

        let models = q.list_models().unwrap();
        assert_eq!(models[0].model, "claude-opus-4-6");
        let sonnet = models.iter().find(|m| m.model == "claude-sonnet-4-6").unwrap();
        assert_eq!(sonnet.turn_count, 2);
        assert!((sonnet.avg_cost_per_turn() - 0.375).abs() < 1e-9);
    }

    #[test]
    fn test_daily_window() {
        let store = seeded();
        let q = QueryService::new(&store);
        let end = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();

        let days = q.daily_totals_ending(end, 2).unwrap();
        let dates: Vec<_> = days.iter().map(|d| d.date.to_string()).collect();
        assert_eq!(dates, vec!["2026-03-02", "2026-03-03"]);

        let all = q.daily_totals_ending(end, 30).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].session_count, 1);
        assert_eq!(all[0].turn_count, 2);

        assert!(q.daily_totals_ending(end, 0).unwrap().is_empty());
    }

    #[test]
    fn test_session_turns_in_time_order() {
        let store = seeded();
        let turns = QueryService::new(&store).session_turns("s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id_key, "m1");
        assert_eq!(turns[1].id_key, "m2");
        assert_eq!(turns[1].timestamp, at(1, 10));
    }

    #[test]
    fn test_totals_and_day() {
        let store = seeded();
        let q = QueryService::new(&store);

        let totals = q.totals().unwrap();
        assert_eq!(totals.session_count, 3);
        assert_eq!(totals.turn_count, 4);
        assert_eq!(totals.tokens.output_tokens, 650);
        assert!((totals.cost_usd - 2.80).abs() < 1e-9);

        let day = q.day_totals(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()).unwrap();
        assert_eq!(day.turn_count, 2);
        assert_eq!(day.session_count, 1);
    }

    #[test]
    fn test_rolling_window_and_rate_limit() {
        let store = seeded();
        let q = QueryService::new(&store);

        let window = q.rolling_window_at(at(1, 12), 5).unwrap();
        assert_eq!(window.totals.turn_count, 2);
        assert_eq!(window.totals.tokens.output_tokens, 300);
        assert_eq!(window.oldest_turn, Some(at(1, 9)));

        let snap = q.snapshot_at(at(1, 12), Plan::Pro).unwrap();
        assert_eq!(snap.rate_limit.used_output_tokens, 300);
        assert_eq!(snap.rate_limit.resets_at, Some(at(1, 14)));
        assert_eq!(snap.today.turn_count, 2);
        assert_eq!(snap.sessions.len(), 3);
    }
}
