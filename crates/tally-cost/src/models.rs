//! Data models for turns, cursors and aggregates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use tally_config::Plan;

/// Token counts for the four priced categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    /// Fresh input tokens
    pub input_tokens: i64,

    /// Output tokens
    pub output_tokens: i64,

    /// Tokens written to the prompt cache
    pub cache_write_tokens: i64,

    /// Tokens served from the prompt cache
    pub cache_read_tokens: i64,
}

impl TokenCounts {
    pub fn new(input: i64, output: i64, cache_write: i64, cache_read: i64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            cache_write_tokens: cache_write,
            cache_read_tokens: cache_read,
        }
    }

    /// Total tokens (input + output + cache).
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_write_tokens + self.cache_read_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for TokenCounts {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

/// One priced assistant response. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Deduplication key (message id, request id, record uuid, or `file:offset`)
    pub id_key: String,

    /// Session identifier
    pub session_id: String,

    /// Working directory of the session
    pub project_path: String,

    /// Model identifier (e.g., "claude-sonnet-4-5-20250929")
    pub model: String,

    /// When the response was recorded
    pub timestamp: DateTime<Utc>,

    /// Token usage
    #[serde(flatten)]
    pub tokens: TokenCounts,

    /// Cost in USD, frozen at ingestion
    pub cost_usd: f64,

    /// Log file the turn was read from
    pub source_file: String,

    /// Byte offset of the record in `source_file`
    pub source_offset: u64,

    /// True when the model had no pricing entry
    pub priced_by_fallback: bool,
}

/// Last committed read position in one log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestCursor {
    pub source_file: String,
    pub byte_offset: u64,
    pub skipped_lines: i64,
    pub updated_at: DateTime<Utc>,
}

/// Per-session aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_path: String,
    /// Every model seen in the session, most used first
    pub models: Vec<String>,
    pub turn_count: i64,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub cost_usd: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Per-project aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_path: String,
    pub session_count: i64,
    pub turn_count: i64,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub cost_usd: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Per-model aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model: String,
    pub turn_count: i64,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub cost_usd: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ModelSummary {
    /// Average cost per turn.
    pub fn avg_cost_per_turn(&self) -> f64 {
        if self.turn_count > 0 {
            self.cost_usd / self.turn_count as f64
        } else {
            0.0
        }
    }
}

/// Per-day aggregate (UTC calendar date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub session_count: i64,
    pub turn_count: i64,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub cost_usd: f64,
}

/// Totals over an arbitrary set of turns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub session_count: i64,
    pub turn_count: i64,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub cost_usd: f64,
}

/// Usage inside a trailing window of hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub hours: u32,
    pub totals: UsageTotals,
    /// Oldest turn still inside the window
    pub oldest_turn: Option<DateTime<Utc>>,
}

/// Output tokens in the rolling window against the plan allowance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub plan: Plan,
    pub limit: i64,
    pub used_output_tokens: i64,
    /// Percentage of the allowance used (may exceed 100)
    pub percent_used: f64,
    /// When the oldest turn leaves the window
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    /// Build from window usage.
    pub fn from_window(plan: Plan, window: &WindowUsage) -> Self {
        let limit = plan.output_token_limit();
        let used = window.totals.tokens.output_tokens;
        let percent_used = if limit > 0 {
            used as f64 / limit as f64 * 100.0
        } else {
            0.0
        };
        let resets_at = window
            .oldest_turn
            .map(|oldest| oldest + chrono::Duration::hours(i64::from(window.hours)));

        Self {
            plan,
            limit,
            used_output_tokens: used,
            percent_used,
            resets_at,
        }
    }
}

/// Everything the dashboard shows, read from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub taken_at: DateTime<Utc>,
    pub totals: UsageTotals,
    pub today: UsageTotals,
    pub window: WindowUsage,
    pub rate_limit: RateLimitStatus,
    pub sessions: Vec<SessionSummary>,
    pub projects: Vec<ProjectSummary>,
    pub models: Vec<ModelSummary>,
    pub daily: Vec<DailySummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_token_counts_total_and_add() {
        let mut counts = TokenCounts::new(100, 50, 200, 300);
        assert_eq!(counts.total(), 650);

        counts += TokenCounts::new(1, 2, 3, 4);
        assert_eq!(counts, TokenCounts::new(101, 52, 203, 304));
        assert!(!counts.is_zero());
        assert!(TokenCounts::default().is_zero());
    }

    #[test]
    fn test_rate_limit_from_window() {
        let oldest = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let window = WindowUsage {
            hours: 5,
            totals: UsageTotals {
                tokens: TokenCounts::new(0, 22_000, 0, 0),
                ..Default::default()
            },
            oldest_turn: Some(oldest),
        };

        let status = RateLimitStatus::from_window(Plan::Pro, &window);
        assert_eq!(status.limit, 44_000);
        assert!((status.percent_used - 50.0).abs() < 1e-9);
        assert_eq!(
            status.resets_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_avg_cost_per_turn_empty() {
        let now = Utc::now();
        let summary = ModelSummary {
            model: "m".into(),
            turn_count: 0,
            tokens: TokenCounts::default(),
            cost_usd: 0.0,
            first_seen: now,
            last_seen: now,
        };
        assert_eq!(summary.avg_cost_per_turn(), 0.0);
    }
}
