//! Periodic dashboard refresh.
//!
//! A [`Refresher`] runs a cancellable timer task that reads a
//! [`DashboardSnapshot`] from the store on every tick and publishes it on a
//! `tokio::sync::watch` channel. A failed read keeps the last good snapshot
//! and sets a warning instead, so the display never goes blank.
//!
//! ## Usage
//!
//! ```no_run
//! use tally_cost::{Refresher, UsageStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> tally_cost::Result<()> {
//!     let store = Arc::new(UsageStore::open("/tmp/usage.db")?);
//!     let handle = Refresher::new(store).start();
//!
//!     let mut updates = handle.subscribe();
//!     while updates.changed().await.is_ok() {
//!         let state = updates.borrow_and_update().clone();
//!         if let Some(snapshot) = state.snapshot {
//!             println!("${:.2} today", snapshot.today.cost_usd);
//!         }
//!     }
//!
//!     handle.stop();
//!     Ok(())
//! }
//! ```

use crate::db::UsageStore;
use crate::error::{CostError, Result};
use crate::models::DashboardSnapshot;
use crate::query::QueryService;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tally_config::Plan;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;

/// Latest published dashboard state.
#[derive(Debug, Clone, Default)]
pub struct RefreshState {
    /// Last snapshot that was read successfully
    pub snapshot: Option<Arc<DashboardSnapshot>>,
    /// Set when the most recent refresh failed
    pub warning: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Incremented on every refresh attempt
    pub generation: u64,
}

impl RefreshState {
    fn apply(&mut self, result: Result<DashboardSnapshot>) {
        match result {
            Ok(snapshot) => {
                self.snapshot = Some(Arc::new(snapshot));
                self.warning = None;
            }
            Err(e) => {
                warn!(error = %e, "Dashboard refresh failed");
                self.warning = Some(e.friendly_message());
            }
        }
        self.refreshed_at = Some(Utc::now());
        self.generation += 1;
    }
}

/// Configuration for the refresher.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Interval between refreshes.
    pub interval: Duration,

    /// Plan used for the rate-limit view.
    pub plan: Plan,

    /// Whether to refresh immediately on startup.
    pub run_on_startup: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            plan: Plan::default(),
            run_on_startup: true,
        }
    }
}

impl RefreshConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the refresh interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the plan.
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    /// Set whether to run on startup.
    pub fn with_run_on_startup(mut self, run_on_startup: bool) -> Self {
        self.run_on_startup = run_on_startup;
        self
    }
}

/// Periodically reads dashboard snapshots.
pub struct Refresher {
    store: Arc<UsageStore>,
    config: RefreshConfig,
}

/// Handle to a running refresher. Dropping it stops the task.
pub struct RefreshHandle {
    rx: watch::Receiver<RefreshState>,
    task: JoinHandle<()>,
}

impl Refresher {
    /// Create a refresher with the default configuration.
    pub fn new(store: Arc<UsageStore>) -> Self {
        Self::with_config(store, RefreshConfig::default())
    }

    pub fn with_config(store: Arc<UsageStore>, config: RefreshConfig) -> Self {
        Self { store, config }
    }

    /// Get the refresh interval.
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Read one snapshot (synchronous, for manual triggering).
    pub fn refresh_once(&self) -> Result<DashboardSnapshot> {
        QueryService::new(&self.store).snapshot(self.config.plan)
    }

    /// Start the background refresh task.
    pub fn start(self) -> RefreshHandle {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            plan = self.config.plan.display_name(),
            "Starting dashboard refresher"
        );

        let (tx, rx) = watch::channel(RefreshState::default());
        let task = tokio::spawn(async move {
            self.run_loop(tx).await;
        });

        RefreshHandle { rx, task }
    }

    async fn run_loop(self, tx: watch::Sender<RefreshState>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick completes immediately
        if !self.config.run_on_startup {
            interval.tick().await;
        }

        loop {
            interval.tick().await;

            let store = Arc::clone(&self.store);
            let plan = self.config.plan;
            let result =
                match tokio::task::spawn_blocking(move || QueryService::new(&store).snapshot(plan))
                    .await
                {
                    Ok(result) => result,
                    Err(e) => Err(CostError::StoreUnavailable(format!(
                        "refresh task failed: {}",
                        e
                    ))),
                };

            tx.send_modify(|state| state.apply(result));

            if tx.is_closed() {
                debug!("All dashboard subscribers gone, stopping refresher");
                break;
            }
        }
    }
}

impl RefreshHandle {
    /// A new receiver for state updates.
    pub fn subscribe(&self) -> watch::Receiver<RefreshState> {
        self.rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the refresh task.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CommitBatch;
    use crate::models::{TokenCounts, Turn};

    fn seed(store: &UsageStore) {
        store
            .commit_batch(&CommitBatch {
                source_file: "/logs/a.jsonl".into(),
                end_offset: 10,
                turns: vec![Turn {
                    id_key: "msg_1".into(),
                    session_id: "s1".into(),
                    project_path: "/p".into(),
                    model: "claude-sonnet-4-6".into(),
                    timestamp: Utc::now(),
                    tokens: TokenCounts::new(10, 20, 0, 0),
                    cost_usd: 0.5,
                    source_file: "/logs/a.jsonl".into(),
                    source_offset: 0,
                    priced_by_fallback: false,
                }],
                skipped_lines: 0,
            })
            .unwrap();
    }

    #[test]
    fn test_refresh_config_builder() {
        let config = RefreshConfig::new()
            .with_interval(Duration::from_secs(30))
            .with_plan(Plan::Max20)
            .with_run_on_startup(false);

        assert_eq!(config.interval.as_secs(), 30);
        assert_eq!(config.plan, Plan::Max20);
        assert!(!config.run_on_startup);
        assert_eq!(RefreshConfig::default().interval.as_secs(), 5);
    }

    #[test]
    fn test_failed_refresh_keeps_last_snapshot() {
        let store = UsageStore::open_in_memory().unwrap();
        seed(&store);
        let snapshot = Refresher::new(Arc::new(store)).refresh_once().unwrap();

        let mut state = RefreshState::default();
        state.apply(Ok(snapshot));
        assert_eq!(state.generation, 1);
        assert!(state.warning.is_none());

        state.apply(Err(CostError::StorageContention {
            operation: "snapshot".into(),
            attempts: 6,
            message: "database is locked".into(),
        }));
        assert_eq!(state.generation, 2);
        assert!(state.warning.is_some());
        let kept = state.snapshot.expect("snapshot should be retained");
        assert_eq!(kept.totals.turn_count, 1);
    }

    #[tokio::test]
    async fn test_refresher_publishes_snapshots() {
        let store = Arc::new(UsageStore::open_in_memory().unwrap());
        seed(&store);

        let handle = Refresher::with_config(
            Arc::clone(&store),
            RefreshConfig::new().with_interval(Duration::from_millis(20)),
        )
        .start();
        let mut rx = handle.subscribe();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("refresh timed out")
            .unwrap();

        let state = rx.borrow_and_update().clone();
        let snapshot = state.snapshot.expect("snapshot published");
        assert_eq!(snapshot.totals.turn_count, 1);
        assert!((snapshot.today.cost_usd - 0.5).abs() < 1e-9);
        assert!(handle.is_running());

        handle.stop();
    }

    #[tokio::test]
    async fn test_refresher_on_empty_store() {
        let store = Arc::new(UsageStore::open_in_memory().unwrap());
        let refresher = Refresher::new(store);
        assert_eq!(refresher.interval().as_secs(), 5);

        let snapshot = refresher.refresh_once().unwrap();
        assert!(snapshot.sessions.is_empty());
        assert_eq!(snapshot.totals.turn_count, 0);
    }
}
