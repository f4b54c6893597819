//! tally - Claude Code token usage and cost tracker
//!
//! Reads Claude Code session logs, prices every assistant turn and keeps
//! per-session, per-project, per-model and per-day totals in SQLite.
//!
//! ## Usage
//!
//! ```bash
//! # Ingest everything under ~/.claude/projects
//! tally backfill
//!
//! # Stop hook entry point (reads the hook payload on stdin)
//! tally hook
//!
//! # Read-only views
//! tally sessions --limit 20
//! tally daily --days 7 --json
//! tally summary
//!
//! # Refresh the summary every few seconds
//! tally watch
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tally_config::{Plan, TallyConfig};
use tally_core::{LogGuard, TallyError, init_logging};
use tally_cost::{
    CostError, DashboardSnapshot, HookPayload, IngestEngine, IngestReport, LogScanner,
    PricingTable, QueryService, RefreshConfig, Refresher, TokenCounts, UsageStore,
};
use tracing::{error, info, warn};

/// Claude Code token usage and cost tracker
///
/// Ingests session logs incrementally and reports what each session,
/// project, model and day cost.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.tally/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Config file (defaults to $TALLY_CONFIG or ~/.tally/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (overrides database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Session log root (overrides projects_dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stop-hook entry point: ingest the finished session. Always exits 0.
    Hook,

    /// Ingest every log file under the root
    Backfill {
        /// Clear all cursors first and re-read every file from the start
        #[arg(long)]
        reset: bool,
    },

    /// Sessions, most recent first
    Sessions {
        #[arg(short, long, default_value_t = tally_cost::query::DEFAULT_SESSION_LIMIT)]
        limit: usize,
    },

    /// Projects by cost
    Projects,

    /// Models by cost
    Models,

    /// Per-day totals
    Daily {
        /// Number of days, including today
        #[arg(short, long, default_value_t = tally_cost::query::DEFAULT_DAILY_DAYS)]
        days: u32,
    },

    /// Every turn of one session
    Session {
        /// Session id
        id: String,
    },

    /// Totals, today, and the rolling rate-limit window (default)
    Summary,

    /// Re-print the summary on every refresh until interrupted
    Watch,

    /// Show or change the subscription plan
    Plan {
        #[command(subcommand)]
        action: Option<PlanAction>,
    },

    /// Recompute all aggregates from the stored turns
    Rebuild,
}

#[derive(Subcommand, Debug)]
enum PlanAction {
    /// Set the plan (pro, max5, max20)
    Set { plan: Plan },
    /// Switch to the next plan
    Next,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The hook runs inside Claude Code and must never fail the caller
    if matches!(cli.command, Some(Command::Hook)) {
        run_hook(&cli);
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            report_tally_error(&e);
            return ExitCode::from(1);
        }
    };

    let _guard = match setup_logging(&cli, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run_command(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tally error: {:#}", e);
            if let Some(cost) = e.downcast_ref::<CostError>() {
                eprintln!("Error: {}", cost.friendly_message());
            } else if let Some(tally) = e.downcast_ref::<TallyError>() {
                report_tally_error(tally);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments and config.
fn setup_logging(cli: &Cli, config: &TallyConfig) -> tally_core::Result<LogGuard> {
    let log_dir = cli.log_dir.clone().or_else(|| config.log_dir.clone());
    init_logging(log_dir, cli.verbose > 0)
}

fn report_tally_error(e: &TallyError) {
    eprintln!("Error: {}", e);
    if let Some(hint) = e.guidance() {
        eprintln!("  {}", hint);
    }
}

fn config_path(cli: &Cli) -> tally_core::Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => TallyConfig::default_path(),
    }
}

/// Load the config file and apply command-line overrides.
fn load_config(cli: &Cli) -> tally_core::Result<TallyConfig> {
    let mut config = match &cli.config {
        Some(path) => TallyConfig::load_from(path)?,
        None => TallyConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if let Some(root) = &cli.root {
        config.projects_dir = root.clone();
    }
    Ok(config)
}

fn open_store(config: &TallyConfig) -> tally_cost::Result<UsageStore> {
    UsageStore::open_with(&config.database_path, config.busy_timeout())
}

fn engine<'a>(store: &'a UsageStore, config: &TallyConfig) -> IngestEngine<'a> {
    IngestEngine::new(
        store,
        LogScanner::new(&config.projects_dir),
        PricingTable::from_config(&config.pricing),
    )
    .with_settle_after(config.settle_after())
}

/// Hook mode: stdin payload in, nothing on stdout, exit 0 no matter what.
fn run_hook(cli: &Cli) {
    let config = load_config(cli);
    let default_config = TallyConfig::default();
    let _guard = setup_logging(cli, config.as_ref().unwrap_or(&default_config)).ok();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Hook skipped: config could not be loaded");
            return;
        }
    };

    let payload = match HookPayload::from_reader(std::io::stdin().lock()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Unreadable hook payload, falling back to full scan");
            HookPayload::default()
        }
    };

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Hook skipped: store unavailable");
            return;
        }
    };

    let report = engine(&store, &config).run_hook(&payload);
    info!(
        session = payload.session_id.as_deref().unwrap_or("-"),
        inserted = report.turns_inserted,
        duplicates = report.duplicates,
        failed = report.files_failed,
        "Hook ingest finished"
    );
}

fn run_command(cli: &Cli, config: TallyConfig) -> anyhow::Result<()> {
    let command = cli.command.as_ref().unwrap_or(&Command::Summary);

    if let Command::Plan { action } = command {
        return run_plan(cli, config, action.as_ref());
    }

    let store = open_store(&config).with_context(|| {
        format!("opening database {}", config.database_path.display())
    })?;

    match command {
        Command::Backfill { reset } => {
            let engine = engine(&store, &config);
            if *reset {
                let cleared = engine.reset_all_cursors()?;
                info!(cleared, "Cleared ingest cursors");
            }
            let report = engine.backfill()?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_ingest_report(&report);
            }
        }
        Command::Sessions { limit } => {
            let sessions = QueryService::new(&store).list_sessions(*limit)?;
            if cli.json {
                print_json(&sessions)?;
            } else {
                println!(
                    "{:<38} {:<28} {:>6} {:>12} {:>10}  {}",
                    "SESSION", "PROJECT", "TURNS", "TOKENS", "COST", "LAST SEEN"
                );
                for s in &sessions {
                    println!(
                        "{:<38} {:<28} {:>6} {:>12} {:>10}  {}",
                        s.session_id,
                        shorten(&s.project_path, 28),
                        s.turn_count,
                        format_tokens(s.tokens.total()),
                        format_cost(s.cost_usd),
                        s.last_seen.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Command::Projects => {
            let projects = QueryService::new(&store).list_projects()?;
            if cli.json {
                print_json(&projects)?;
            } else {
                println!(
                    "{:<40} {:>8} {:>6} {:>12} {:>10}",
                    "PROJECT", "SESSIONS", "TURNS", "TOKENS", "COST"
                );
                for p in &projects {
                    println!(
                        "{:<40} {:>8} {:>6} {:>12} {:>10}",
                        shorten(&p.project_path, 40),
                        p.session_count,
                        p.turn_count,
                        format_tokens(p.tokens.total()),
                        format_cost(p.cost_usd)
                    );
                }
            }
        }
        Command::Models => {
            let models = QueryService::new(&store).list_models()?;
            if cli.json {
                print_json(&models)?;
            } else {
                println!(
                    "{:<32} {:>6} {:>12} {:>10} {:>10}",
                    "MODEL", "TURNS", "TOKENS", "COST", "PER TURN"
                );
                for m in &models {
                    println!(
                        "{:<32} {:>6} {:>12} {:>10} {:>10}",
                        shorten(&m.model, 32),
                        m.turn_count,
                        format_tokens(m.tokens.total()),
                        format_cost(m.cost_usd),
                        format_cost(m.avg_cost_per_turn())
                    );
                }
            }
        }
        Command::Daily { days } => {
            let daily = QueryService::new(&store).daily_totals(*days)?;
            if cli.json {
                print_json(&daily)?;
            } else {
                println!(
                    "{:<10} {:>8} {:>6} {:>12} {:>10}",
                    "DATE", "SESSIONS", "TURNS", "TOKENS", "COST"
                );
                for d in &daily {
                    println!(
                        "{:<10} {:>8} {:>6} {:>12} {:>10}",
                        d.date,
                        d.session_count,
                        d.turn_count,
                        format_tokens(d.tokens.total()),
                        format_cost(d.cost_usd)
                    );
                }
            }
        }
        Command::Session { id } => {
            let turns = QueryService::new(&store).session_turns(id)?;
            if cli.json {
                print_json(&turns)?;
            } else if turns.is_empty() {
                println!("No turns recorded for session {}", id);
            } else {
                println!(
                    "{:<19} {:<28} {:>10} {:>10} {:>10} {:>10} {:>10}",
                    "TIME", "MODEL", "INPUT", "OUTPUT", "CACHE W", "CACHE R", "COST"
                );
                let mut total = TokenCounts::default();
                let mut cost = 0.0;
                for t in &turns {
                    println!(
                        "{:<19} {:<28} {:>10} {:>10} {:>10} {:>10} {:>10}",
                        t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        shorten(&t.model, 28),
                        format_tokens(t.tokens.input_tokens),
                        format_tokens(t.tokens.output_tokens),
                        format_tokens(t.tokens.cache_write_tokens),
                        format_tokens(t.tokens.cache_read_tokens),
                        format_cost(t.cost_usd)
                    );
                    total += t.tokens;
                    cost += t.cost_usd;
                }
                println!(
                    "{} turns, {} tokens, {}",
                    turns.len(),
                    format_tokens(total.total()),
                    format_cost(cost)
                );
            }
        }
        Command::Summary => {
            let snapshot = QueryService::new(&store).snapshot(config.plan)?;
            if cli.json {
                print_json(&snapshot)?;
            } else {
                print_summary(&snapshot);
            }
        }
        Command::Watch => {
            engine(&store, &config).backfill()?;
            run_watch(Arc::new(store), &config, cli.json)?;
        }
        Command::Rebuild => {
            let turns = store.rebuild_aggregates()?;
            println!("Rebuilt aggregates from {} turns", turns);
        }
        Command::Hook | Command::Plan { .. } => {}
    }

    Ok(())
}

fn run_plan(cli: &Cli, mut config: TallyConfig, action: Option<&PlanAction>) -> anyhow::Result<()> {
    let next = match action {
        None => None,
        Some(PlanAction::Set { plan }) => Some(*plan),
        Some(PlanAction::Next) => Some(config.plan.next()),
    };

    if let Some(plan) = next {
        // Persist the file's own contents, not the command-line overrides
        let path = config_path(cli)?;
        let mut stored = TallyConfig::load_from(&path)?;
        stored.plan = plan;
        stored.save(&path)?;
        info!(plan = plan.display_name(), path = %path.display(), "Plan updated");
        config.plan = plan;
    }

    println!(
        "{} ({} output tokens per {}h window)",
        config.plan.display_name(),
        format_tokens(config.plan.output_token_limit()),
        tally_cost::query::RATE_LIMIT_WINDOW_HOURS
    );
    Ok(())
}

fn run_watch(store: Arc<UsageStore>, config: &TallyConfig, json: bool) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async {
        let handle = Refresher::with_config(
            store,
            RefreshConfig::new()
                .with_interval(config.refresh_interval())
                .with_plan(config.plan),
        )
        .start();
        let mut updates = handle.subscribe();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = updates.borrow_and_update().clone();
                    if let Some(warning) = &state.warning {
                        eprintln!("warning: {}", warning);
                    }
                    if let Some(snapshot) = state.snapshot {
                        if json {
                            print_json(snapshot.as_ref())?;
                        } else {
                            if std::io::stdout().is_terminal() {
                                print!("\x1b[2J\x1b[H");
                            }
                            print_summary(&snapshot);
                        }
                    }
                }
            }
        }

        handle.stop();
        info!("Watch stopped");
        Ok(())
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_ingest_report(report: &IngestReport) {
    println!("Files scanned:   {}", report.files_scanned);
    println!("Turns parsed:    {}", report.turns_parsed);
    println!("Turns inserted:  {}", report.turns_inserted);
    println!("Duplicates:      {}", report.duplicates);
    println!("Lines skipped:   {}", report.lines_skipped);
    if report.turns_deferred > 0 {
        println!("Still streaming: {} (committed once the file settles)", report.turns_deferred);
    }
    if report.files_failed > 0 {
        println!("Files failed:    {}", report.files_failed);
    }
    if !report.unknown_models.is_empty() {
        let models: Vec<&str> = report.unknown_models.iter().map(String::as_str).collect();
        println!("Unknown models (priced at fallback rates): {}", models.join(", "));
    }
}

fn print_summary(snapshot: &DashboardSnapshot) {
    let totals = &snapshot.totals;
    let today = &snapshot.today;
    let limit = &snapshot.rate_limit;

    println!("tally  {}", snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!(
        "All time  {:>10}  {:>12} tokens  {} turns in {} sessions",
        format_cost(totals.cost_usd),
        format_tokens(totals.tokens.total()),
        totals.turn_count,
        totals.session_count
    );
    println!(
        "Today     {:>10}  {:>12} tokens  {} turns in {} sessions",
        format_cost(today.cost_usd),
        format_tokens(today.tokens.total()),
        today.turn_count,
        today.session_count
    );
    println!(
        "Last {}h  {:>10}  {} / {} output tokens ({:.1}%, {})",
        snapshot.window.hours,
        format_cost(snapshot.window.totals.cost_usd),
        format_tokens(limit.used_output_tokens),
        format_tokens(limit.limit),
        limit.percent_used,
        limit.plan.display_name()
    );
    if let Some(resets_at) = limit.resets_at {
        println!("          window frees up at {}", resets_at.format("%H:%M UTC"));
    }

    if !snapshot.models.is_empty() {
        println!();
        for m in snapshot.models.iter().take(5) {
            println!(
                "  {:<32} {:>10}  {:>6} turns",
                shorten(&m.model, 32),
                format_cost(m.cost_usd),
                m.turn_count
            );
        }
    }

    if !snapshot.sessions.is_empty() {
        println!();
        for s in snapshot.sessions.iter().take(5) {
            println!(
                "  {:<38} {:>10}  {}",
                s.session_id,
                format_cost(s.cost_usd),
                shorten(&s.project_path, 30)
            );
        }
    }
}

fn format_cost(cost: f64) -> String {
    if cost > 0.0 && cost < 0.01 {
        format!("${:.4}", cost)
    } else {
        format!("${:.2}", cost)
    }
}

/// Thousands-separated token count.
fn format_tokens(count: i64) -> String {
    let digits = count.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if count < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Keep the tail of long values, which is the informative part of a path.
fn shorten(value: &str, width: usize) -> String {
    let count = value.chars().count();
    if count <= width {
        return value.to_string();
    }
    let tail: String = value.chars().skip(count - (width - 1)).collect();
    format!("…{}", tail)
}
