//! realmwatch.toml configuration parser with environment overrides.
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file, then the environment variables the realm status service has always
//! honoured (`REALM_STATUS_SCHEDULER_ENABLED`, `REALM_STATUS_FETCH_INTERVAL`,
//! `REALM_STATUS_NETWORK`, `REALMS_CONFIG`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::duration::serde_duration;
use crate::types::RealmConfig;

pub const ENV_SCHEDULER_ENABLED: &str = "REALM_STATUS_SCHEDULER_ENABLED";
pub const ENV_FETCH_INTERVAL: &str = "REALM_STATUS_FETCH_INTERVAL";
pub const ENV_NETWORK: &str = "REALM_STATUS_NETWORK";
pub const ENV_REALMS: &str = "REALMS_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmwatchConfig {
    pub scheduler: SchedulerSettings,
    pub fetcher: FetcherSettings,
    pub scoring: ScoringSettings,
    pub storage: StorageSettings,
    pub api: ApiSettings,
    pub realms: Vec<RealmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Start the polling loop automatically.
    pub enabled: bool,
    /// Default interval between successful fetches of a realm.
    #[serde(with = "serde_duration")]
    pub fetch_interval: Duration,
    /// Network passed to the fetcher ("ic", "staging", "local").
    pub network: String,
    pub max_concurrent_fetches: usize,
    #[serde(with = "serde_duration")]
    pub fetch_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub store_timeout: Duration,
    /// First retry delay after a failure; doubles per consecutive failure.
    #[serde(with = "serde_duration")]
    pub retry_base: Duration,
    /// Ceiling for the failure backoff.
    #[serde(with = "serde_duration")]
    pub max_backoff: Duration,
    /// How often the control loop looks for due realms.
    #[serde(with = "serde_duration")]
    pub tick_interval: Duration,
    /// Consecutive failures before a realm is reported unhealthy.
    pub unhealthy_threshold: u32,
    /// Fetch a realm right after registration instead of waiting one interval.
    pub fetch_on_register: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            fetch_interval: Duration::from_secs(300),
            network: "ic".to_string(),
            max_concurrent_fetches: 4,
            fetch_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
            retry_base: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(1),
            unhealthy_threshold: 3,
            fetch_on_register: true,
        }
    }
}

/// Which transport is used to query realms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    /// `dfx canister call <principal> status`.
    #[default]
    Dfx,
    /// `GET <url><status_path>`.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    pub kind: FetcherKind,
    /// Path appended to the realm URL by the HTTP fetcher.
    pub status_path: String,
    /// dfx executable used by the dfx fetcher.
    pub dfx_binary: String,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            kind: FetcherKind::Dfx,
            status_path: String::new(),
            dfx_binary: "dfx".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Trailing window, in days, that counts as "recent activity".
    pub activity_window_days: u32,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            activity_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Database file; defaults to `<data-dir>/realmwatch.redb`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl RealmwatchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: RealmwatchConfig =
            toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load defaults, then the file (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables using the given lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SCHEDULER_ENABLED) {
            self.scheduler.enabled = raw.trim().eq_ignore_ascii_case("true");
        }
        if let Some(raw) = lookup(ENV_FETCH_INTERVAL) {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_FETCH_INTERVAL} must be whole seconds, got {raw:?}"))?;
            self.scheduler.fetch_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup(ENV_NETWORK) {
            let network = raw.trim();
            if !network.is_empty() {
                self.scheduler.network = network.to_string();
            }
        }
        if let Some(raw) = lookup(ENV_REALMS) {
            self.realms = serde_json::from_str(&raw)
                .with_context(|| format!("{ENV_REALMS} must be a JSON array of realms"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scheduler;
        if s.fetch_interval.is_zero() {
            bail!("scheduler.fetch_interval must be greater than zero");
        }
        if s.tick_interval.is_zero() {
            bail!("scheduler.tick_interval must be greater than zero");
        }
        if s.fetch_timeout.is_zero() || s.store_timeout.is_zero() {
            bail!("scheduler timeouts must be greater than zero");
        }
        if s.max_concurrent_fetches == 0 {
            bail!("scheduler.max_concurrent_fetches must be at least 1");
        }
        if s.retry_base.is_zero() || s.max_backoff < s.retry_base {
            bail!("scheduler.max_backoff must be at least scheduler.retry_base (> 0)");
        }
        if s.network.trim().is_empty() {
            bail!("scheduler.network must not be empty");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
