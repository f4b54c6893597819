//! # tally-cost
//!
//! Token usage and cost tracking for Claude Code sessions.
//!
//! This crate provides:
//! - [`LogScanner`] - Find session logs and read their unread, complete lines
//! - [`RecordParser`] - Turn log records into typed turn candidates
//! - [`PricingTable`] - Per-model rates and cost calculation
//! - [`IngestEngine`] - Deduplicating, cursor-based ingestion
//! - [`UsageStore`] - SQLite storage with incrementally maintained aggregates
//! - [`QueryService`] - Read-only views over the aggregates
//! - [`Refresher`] - Timer task that publishes dashboard snapshots
//!
//! ## Example
//!
//! ```no_run
//! use tally_cost::{IngestEngine, LogScanner, PricingTable, QueryService, UsageStore};
//!
//! fn main() -> tally_cost::Result<()> {
//!     let store = UsageStore::open("/tmp/usage.db")?;
//!
//!     let scanner = LogScanner::new("/home/me/.claude/projects");
//!     let engine = IngestEngine::new(&store, scanner, PricingTable::builtin());
//!     let report = engine.backfill()?;
//!     println!("ingested {} new turns", report.turns_inserted);
//!
//!     let query = QueryService::new(&store);
//!     for session in query.list_sessions(10)? {
//!         println!("{} ${:.2}", session.session_id, session.cost_usd);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
pub mod hook;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod pricing;
pub mod query;
pub mod refresh;
pub mod scanner;

// Re-export main types
pub use db::{CommitBatch, CommitOutcome, UsageStore};
pub use error::{CostError, Result};
pub use hook::{HookPayload, HookTarget};
pub use ingest::{FileReport, IngestEngine, IngestReport};
pub use models::{
    DailySummary, DashboardSnapshot, IngestCursor, ModelSummary, ProjectSummary,
    RateLimitStatus, SessionSummary, TokenCounts, Turn, UsageTotals, WindowUsage,
};
pub use parser::{ParseError, ParsedLine, RecordParser, TurnCandidate};
pub use pricing::{ModelRates, PricedCost, PricingTable, UnknownModelWarning};
pub use query::QueryService;
pub use refresh::{RefreshConfig, RefreshHandle, RefreshState, Refresher};
pub use scanner::{LogScanner, PendingRange};
