//! # tally-config
//!
//! YAML configuration for tally, loaded from `~/.tally/config.yaml` (or the
//! path in `$TALLY_CONFIG`). Every field has a default, so a missing file or a
//! partial file is fine.
//!
//! ```yaml
//! projects_dir: ~/.claude/projects
//! database_path: ~/.tally/usage.db
//! plan: max5
//! refresh_interval_secs: 5
//! settle_after_secs: 120
//! pricing:
//!   fallback: zero
//!   models:
//!     claude-sonnet-4-5:
//!       input: 3.0
//!       output: 15.0
//!       cache_write: 3.75
//!       cache_read: 0.30
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_core::{Result, TallyError};
use tracing::debug;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "TALLY_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Root directory scanned for Claude Code session logs
    pub projects_dir: PathBuf,

    /// SQLite database holding turns, cursors and aggregates
    pub database_path: PathBuf,

    /// Directory for tally's own logs (defaults to `~/.tally/logs`)
    pub log_dir: Option<PathBuf>,

    /// Subscription plan used for the rolling-window limit
    pub plan: Plan,

    /// Seconds between refreshes in `tally watch`
    pub refresh_interval_secs: u64,

    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,

    /// Seconds a log must sit unmodified before its last message counts as
    /// final during backfill (0 commits it immediately)
    pub settle_after_secs: u64,

    /// Pricing overrides
    pub pricing: PricingConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            projects_dir: home.join(".claude").join("projects"),
            database_path: home.join(".tally").join("usage.db"),
            log_dir: None,
            plan: Plan::default(),
            refresh_interval_secs: 5,
            busy_timeout_ms: 5_000,
            settle_after_secs: 120,
            pricing: PricingConfig::default(),
        }
    }
}

/// Claude subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Pro,
    Max5,
    Max20,
}

impl Plan {
    /// All plans, in cycling order.
    pub const ALL: [Plan; 3] = [Plan::Pro, Plan::Max5, Plan::Max20];

    /// Approximate output-token allowance per 5-hour rolling window.
    pub fn output_token_limit(&self) -> i64 {
        match self {
            Plan::Pro => 44_000,
            Plan::Max5 => 88_000,
            Plan::Max20 => 220_000,
        }
    }

    /// Human-readable plan name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Plan::Pro => "Pro",
            Plan::Max5 => "Max 5x",
            Plan::Max20 => "Max 20x",
        }
    }

    /// The plan after this one, wrapping around.
    pub fn next(&self) -> Plan {
        let at = Self::ALL.iter().position(|p| p == self).unwrap_or(0);
        Self::ALL[(at + 1) % Self::ALL.len()]
    }
}

impl std::str::FromStr for Plan {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pro" => Ok(Plan::Pro),
            "max5" => Ok(Plan::Max5),
            "max20" => Ok(Plan::Max20),
            other => Err(TallyError::validation(format!(
                "unknown plan '{other}', expected one of pro, max5, max20"
            ))),
        }
    }
}

/// Per-million-token rates for one model, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_write: f64,
    #[serde(default)]
    pub cache_read: f64,
}

/// What to charge for a model missing from the pricing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Sonnet-class rates
    #[default]
    Default,
    /// Count tokens, charge nothing
    Zero,
}

/// Pricing section of the config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Model id (or id prefix) to rates; merged over the built-in table
    pub models: BTreeMap<String, RateConfig>,

    /// Behaviour for unknown models
    pub fallback: FallbackPolicy,
}

impl TallyConfig {
    /// Resolve the config file path: `$TALLY_CONFIG`, else `~/.tally/config.yaml`.
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Ok(PathBuf::from(path));
        }
        Ok(tally_core::logging::tally_home()?.join("config.yaml"))
    }

    /// Load from the default path. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path()?)
    }

    /// Load from an explicit path. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(TallyError::io("reading config", path, e)),
        };

        let config = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(&contents).map_err(|e| TallyError::ConfigInvalid {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        let config = config.expand_paths();
        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Write the config to `path`, replacing it atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TallyError::DirectoryCreation {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let yaml = serde_yaml::to_string(self).map_err(|e| TallyError::ConfigSerialize {
            message: e.to_string(),
        })?;

        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|e| TallyError::io("writing config", &tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| TallyError::io("replacing config", path, e))?;
        Ok(())
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(TallyError::validation("database_path must not be empty"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(TallyError::validation(
                "refresh_interval_secs must be at least 1",
            ));
        }
        for (model, rates) in &self.pricing.models {
            let all = [rates.input, rates.output, rates.cache_write, rates.cache_read];
            if all.iter().any(|r| !r.is_finite() || *r < 0.0) {
                return Err(TallyError::validation(format!(
                    "pricing for '{model}' has a negative or non-finite rate"
                )));
            }
        }
        Ok(())
    }

    /// Refresh interval as a [`Duration`].
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Busy timeout as a [`Duration`].
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Settle window as a [`Duration`].
    pub fn settle_after(&self) -> Duration {
        Duration::from_secs(self.settle_after_secs)
    }

    fn expand_paths(mut self) -> Self {
        self.projects_dir = expand_home(&self.projects_dir);
        self.database_path = expand_home(&self.database_path);
        self.log_dir = self.log_dir.as_deref().map(expand_home);
        self
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = TallyConfig::load_from(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, TallyConfig::default());
        assert_eq!(config.plan, Plan::Pro);
        assert_eq!(config.refresh_interval_secs, 5);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "plan: max20\npricing:\n  fallback: zero\n  models:\n    my-model:\n      input: 1.0\n      output: 2.0\n",
        )
        .unwrap();

        let config = TallyConfig::load_from(&path).unwrap();
        assert_eq!(config.plan, Plan::Max20);
        assert_eq!(config.pricing.fallback, FallbackPolicy::Zero);
        let rates = config.pricing.models["my-model"];
        assert_eq!(rates.output, 2.0);
        assert_eq!(rates.cache_read, 0.0);
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.settle_after(), Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "plan: [unterminated").unwrap();

        let err = TallyConfig::load_from(&path).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut config = TallyConfig::default();
        config.pricing.models.insert(
            "bad".into(),
            RateConfig {
                input: -1.0,
                output: 1.0,
                cache_write: 0.0,
                cache_read: 0.0,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_refresh_interval_rejected() {
        let config = TallyConfig {
            refresh_interval_secs: 0,
            ..TallyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let config = TallyConfig {
            plan: Plan::Max5,
            database_path: dir.path().join("usage.db"),
            ..TallyConfig::default()
        };

        config.save(&path).unwrap();
        let loaded = TallyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.plan, Plan::Max5);
        assert_eq!(loaded.database_path, dir.path().join("usage.db"));
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn test_plan_cycle_and_limits() {
        assert_eq!(Plan::Pro.next(), Plan::Max5);
        assert_eq!(Plan::Max20.next(), Plan::Pro);
        assert_eq!(Plan::Max5.output_token_limit(), 88_000);
        assert_eq!("MAX20".parse::<Plan>().unwrap(), Plan::Max20);
        assert!("team".parse::<Plan>().is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_overrides_path() {
        // SAFETY: serialized with every other test that touches the environment
        unsafe { std::env::set_var(CONFIG_ENV_VAR, "/tmp/elsewhere.yaml") };
        let path = TallyConfig::default_path().unwrap();
        unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
        assert_eq!(path, PathBuf::from("/tmp/elsewhere.yaml"));
    }

    #[test]
    #[serial]
    fn test_load_reads_env_var_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, "plan: max5\nsettle_after_secs: 0\n").unwrap();

        // SAFETY: serialized with every other test that touches the environment
        unsafe { std::env::set_var(CONFIG_ENV_VAR, &path) };
        let loaded = TallyConfig::load();
        unsafe { std::env::remove_var(CONFIG_ENV_VAR) };

        let config = loaded.unwrap();
        assert_eq!(config.plan, Plan::Max5);
        assert_eq!(config.settle_after_secs, 0);
    }

    #[test]
    #[serial]
    fn test_expand_home() {
        // SAFETY: serialized with every other test that touches the environment
        unsafe { std::env::set_var("HOME", "/tmp/test-home") };
        assert_eq!(
            expand_home(Path::new("~/.claude/projects")),
            PathBuf::from("/tmp/test-home/.claude/projects")
        );
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
