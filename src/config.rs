//! Hierarchical configuration.
//!
//! Values come from an optional YAML file (`--config`, or
//! `$XDG_CONFIG_HOME/callout/config.yaml`) overridden by `CALLOUT_`-prefixed
//! environment variables, with `__` separating path segments (for example
//! `CALLOUT_WATCH__PORT=9090` or `CALLOUT_DISPATCHER__DRY_RUN=true`).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub slots: SlotsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourceConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SlackConfig {
    #[serde(default)]
    pub app: SlackAppConfig,
    /// Override for the Slack API base URL; used by tests.
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SlackAppConfig {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GitConfig {
    /// Per-host access tokens for the git fetcher.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_email_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
}

fn default_email_port() -> u16 {
    587
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_email_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreConfig {
    #[serde(rename = "type", default = "default_datastore_type")]
    pub kind: String,
    /// Embedded backend database file; defaults to the user data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Cloud backend connection string.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_datastore_type() -> String {
    "embedded".to_string()
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            kind: default_datastore_type(),
            path: None,
            url: None,
        }
    }
}

/// Weekday name (lowercase) to ordered "HH:MM" slot times.
pub type DaySlots = BTreeMap<String, Vec<String>>;

/// One `slots.<scope>` entry: either a weekday table directly, or a table
/// of recipients (plus `default`) each holding a weekday table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SlotScope {
    ByRecipient(BTreeMap<String, DaySlots>),
    Days(DaySlots),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotsConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(flatten)]
    pub scopes: BTreeMap<String, SlotScope>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            scopes: BTreeMap::new(),
        }
    }
}

/// Destination strings become config keys; `.` and `#` are replaced so the
/// same key works across config backends.
pub fn sanitize_recipient(recipient: &str) -> String {
    recipient.replace(['.', '#'], "_")
}

impl SlotsConfig {
    /// Resolve the slot table for a destination, most specific scope first:
    /// `slots.<type>.<recipient>`, `slots.<type>.default`, `slots.default`.
    pub fn resolve(&self, kind: &str, recipient: &str) -> Option<&DaySlots> {
        match self.scopes.get(kind) {
            Some(SlotScope::ByRecipient(recipients)) => {
                if let Some(days) = recipients.get(&sanitize_recipient(recipient)) {
                    return Some(days);
                }
                if let Some(days) = recipients.get("default") {
                    return Some(days);
                }
            }
            Some(SlotScope::Days(days)) => return Some(days),
            None => {}
        }
        match self.scopes.get("default") {
            Some(SlotScope::Days(days)) => Some(days),
            Some(SlotScope::ByRecipient(recipients)) => recipients.get("default"),
            None => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub calculation: CalculationConfig,
    /// How far past its scheduled time a call may still be dispatched.
    #[serde(
        default = "default_missed_lookback",
        with = "humantime_serde"
    )]
    pub missed_lookback: Duration,
}

fn default_missed_lookback() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            calculation: CalculationConfig::default(),
            missed_lookback: default_missed_lookback(),
        }
    }
}

/// The rolling calculation window: schedule entries are expanded for
/// `[now - before, now + after)`.
#[derive(Debug, Clone, Deserialize)]
pub struct CalculationConfig {
    #[serde(default = "default_calculation_before", with = "humantime_serde")]
    pub before: Duration,
    #[serde(default = "default_calculation_after", with = "humantime_serde")]
    pub after: Duration,
}

fn default_calculation_before() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_calculation_after() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            before: default_calculation_before(),
            after: default_calculation_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(default = "default_watch_port")]
    pub port: u16,
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_watch_port() -> u16 {
    8080
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            port: default_watch_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load the configuration, layering the config file (explicit path, or
    /// the default location when present) under environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        match config_file {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                if let Some(dir) = dirs::config_dir() {
                    builder = builder.add_source(
                        config::File::from(dir.join("callout").join("config.yaml"))
                            .required(false),
                    );
                }
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CALLOUT")
                .prefix_separator("_")
                .separator("__"),
        );
        builder.build()?.try_deserialize()
    }
}
