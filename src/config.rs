//! TOML configuration for bugwatch.
//!
//! Layered lookup: explicit `--config` path, the `BUGWATCH_CONFIG`
//! environment variable, `/etc/bugwatch/bugwatch.toml`, then compiled-in
//! defaults.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::baseline::Bucketing;
use crate::classify::ClassifierConfig;
use crate::detect::policy::{PolicyMode, ThresholdOverrides, Thresholds};
use crate::fetch::{RetryPolicy, DEFAULT_MAX_PAGES};

pub const CONFIG_ENV: &str = "BUGWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/bugwatch/bugwatch.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub alerting: AlertingConfig,
    pub fetch: FetchConfig,
    pub notify: NotifyConfig,
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), sources = config.sources.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// An explicit path must load; the environment and system locations
    /// fall through with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BUGWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_thresholds("alerting.thresholds", &self.alerting.thresholds)?;

        if self.schedule.cron.trim().is_empty() {
            return Err(ConfigError::Invalid("schedule.cron is empty".into()));
        }
        cron::Schedule::from_str(&self.schedule.cron)
            .map_err(|e| ConfigError::Invalid(format!("schedule.cron '{}': {}", self.schedule.cron, e)))?;

        if self.fetch.max_pages == 0 {
            return Err(ConfigError::Invalid("fetch.max-pages must be at least 1".into()));
        }
        if self.fetch.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("fetch.retry.max-attempts must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid("source with an empty name".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source name '{}'", source.name)));
            }
            if source.thresholds.is_some() {
                validate_thresholds(&format!("sources.{}.thresholds", source.name), &self.thresholds_for(source))?;
            }
            if let Some(days) = source.lookback_days {
                if days <= 0 {
                    return Err(ConfigError::Invalid(format!(
                        "sources.{}.lookback-days must be positive",
                        source.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// The global thresholds with the source's overrides applied.
    pub fn thresholds_for(&self, source: &SourceConfig) -> Thresholds {
        match &source.thresholds {
            Some(overrides) => overrides.apply(&self.alerting.thresholds),
            None => self.alerting.thresholds,
        }
    }
}

fn validate_thresholds(section: &str, t: &Thresholds) -> Result<(), ConfigError> {
    let probabilities = [
        ("elevated-probability-threshold", t.elevated_probability_threshold),
        ("critical-probability-threshold", t.critical_probability_threshold),
        ("clear-probability-threshold", t.clear_probability_threshold),
    ];
    for (name, p) in probabilities {
        if !(p > 0.0 && p <= 1.0) {
            return Err(ConfigError::Invalid(format!("{}.{} = {} is outside (0, 1]", section, name, p)));
        }
    }
    if t.critical_probability_threshold < t.elevated_probability_threshold {
        return Err(ConfigError::Invalid(format!(
            "{}: critical-probability-threshold is below elevated-probability-threshold",
            section
        )));
    }
    if t.clear_probability_threshold > t.elevated_probability_threshold {
        return Err(ConfigError::Invalid(format!(
            "{}: clear-probability-threshold is above elevated-probability-threshold",
            section
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Storage and schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// SQLite database holding checkpoints, baselines and incidents.
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("/var/lib/bugwatch/bugwatch.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first).
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 */10 * * * *".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alerting and fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AlertingConfig {
    pub thresholds: Thresholds,
    pub policy: PolicyMode,
    /// Chat channel for elevated-rate notices.
    pub channel: String,
    /// On-call service paged on critical spikes; no page when unset.
    pub page_service: Option<String>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            policy: PolicyMode::default(),
            channel: "#bugwatch".to_string(),
            page_service: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FetchConfig {
    pub retry: RetryPolicy,
    pub request_timeout_secs: u64,
    pub max_pages: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout_secs: 30,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NotifyConfig {
    pub slack: Option<SlackConfig>,
    pub pagerduty: Option<PagerDutyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlackConfig {
    /// File holding the incoming-webhook URL.
    pub webhook_url_file: PathBuf,
    #[serde(default = "default_slack_username")]
    pub username: String,
}

fn default_slack_username() -> String {
    "bugwatch".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PagerDutyConfig {
    #[serde(default = "default_events_url")]
    pub events_url: String,
    /// Service name to the file holding its Events API v2 routing key.
    pub routing_key_files: BTreeMap<String, PathBuf>,
}

fn default_events_url() -> String {
    "https://events.pagerduty.com/v2/enqueue".to_string()
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub api: ApiConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// First-run lookback; the adapter's default when unset.
    #[serde(default)]
    pub lookback_days: Option<i64>,
    #[serde(default)]
    pub freshness_lag_secs: Option<i64>,
    #[serde(default)]
    pub bucketing: Bucketing,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub page_service: Option<String>,
    #[serde(default)]
    pub thresholds: Option<ThresholdOverrides>,
    /// Triage view appended to alert messages.
    #[serde(default)]
    pub link: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ApiConfig {
    #[serde(rename_all = "kebab-case")]
    Zendesk {
        base_url: String,
        user: String,
        password_file: PathBuf,
    },
    #[serde(rename_all = "kebab-case")]
    Jira {
        base_url: String,
        user: String,
        password_file: PathBuf,
        /// Project clause; the creation bound and ordering are appended.
        jql: String,
        dimension_field: String,
    },
    #[serde(rename_all = "kebab-case")]
    Github {
        owner: String,
        repo: String,
        #[serde(default)]
        api_base: Option<String>,
        #[serde(default)]
        token_file: Option<PathBuf>,
        #[serde(default)]
        dimension_prefix: Option<String>,
        #[serde(default)]
        dimension_suffix: Option<String>,
        /// Logins that file issues for many users, e.g. a bug-report bot.
        #[serde(default)]
        relay_logins: Vec<String>,
    },
    #[serde(rename_all = "kebab-case")]
    Uservoice {
        base_url: String,
        forum_id: u64,
        api_key_file: PathBuf,
    },
}

impl ApiConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiConfig::Zendesk { .. } => "zendesk",
            ApiConfig::Jira { .. } => "jira",
            ApiConfig::Github { .. } => "github",
            ApiConfig::Uservoice { .. } => "uservoice",
        }
    }
}
