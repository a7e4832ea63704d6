use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::publish::DEFAULT_DIGEST_LINK;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub relays: RelaysConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub poster: PosterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelaysConfig {
    #[serde(default = "default_relay_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PosterConfig {
    /// Signing key of the stats account. Posting is disabled without it.
    pub nsec: Option<String>,
    #[serde(default = "default_digest_link")]
    pub digest_link: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_store_uri(),
            database: default_database(),
            timeout_secs: default_store_timeout(),
        }
    }
}

impl Default for RelaysConfig {
    fn default() -> Self {
        Self {
            urls: default_relay_urls(),
            connect_timeout_secs: default_connect_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            cycle_timeout_secs: default_cycle_timeout(),
        }
    }
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            nsec: None,
            digest_link: default_digest_link(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_store_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "trustroots".to_string()
}

fn default_store_timeout() -> u64 {
    30
}

fn default_relay_urls() -> Vec<String> {
    vec![
        "wss://relay.trustroots.org".to_string(),
        "wss://relay.nomadwiki.org".to_string(),
    ]
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_query_timeout() -> u64 {
    30
}

fn default_output_path() -> String {
    "public/kpi.json".to_string()
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_cycle_timeout() -> u64 {
    120
}

fn default_digest_link() -> String {
    DEFAULT_DIGEST_LINK.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Parse the file if it exists; a missing file means all defaults.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let path_ref = Path::new(expanded_path.as_ref());
        if !path_ref.exists() {
            tracing::debug!("Config file {} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    /// Load the file, then let the process environment override it.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Environment overrides, read through `lookup`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(uri) = var("MONGO_URI") {
            self.store.uri = uri;
        }
        if let Some(database) = var("MONGO_DB") {
            self.store.database = database;
        }
        if let Some(relays) = var("NOSTR_RELAYS") {
            self.relays.urls = relays
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = var("OUTPUT_PATH") {
            self.output.path = path;
        }
        if let Some(minutes) = var("UPDATE_INTERVAL_MINUTES") {
            self.schedule.interval_minutes = minutes
                .trim()
                .parse()
                .with_context(|| format!("UPDATE_INTERVAL_MINUTES is not a number: {}", minutes))?;
        }
        if let Some(nsec) = var("NSEC_STATS") {
            self.poster.nsec = Some(nsec);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.store.uri.starts_with("mongodb://") && !self.store.uri.starts_with("mongodb+srv://") {
            anyhow::bail!("Store URI must start with mongodb:// or mongodb+srv://");
        }

        if self.store.database.trim().is_empty() {
            anyhow::bail!("Store database name must not be empty");
        }

        for url in &self.relays.urls {
            if !url.starts_with("wss://") && !url.starts_with("ws://") {
                anyhow::bail!("Relay URL must start with ws:// or wss://: {}", url);
            }
        }

        if self.output.path.trim().is_empty() {
            anyhow::bail!("Output path must not be empty");
        }

        if self.schedule.interval_minutes == 0 {
            anyhow::bail!("Update interval must be at least one minute");
        }

        let timeouts = [
            ("store.timeout_secs", self.store.timeout_secs),
            ("relays.connect_timeout_secs", self.relays.connect_timeout_secs),
            ("relays.query_timeout_secs", self.relays.query_timeout_secs),
            ("schedule.cycle_timeout_secs", self.schedule.cycle_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        Ok(())
    }

    /// Absolute output path; relative paths resolve against the working directory.
    pub fn resolve_output_path(&self) -> Result<PathBuf> {
        let expanded = PathBuf::from(shellexpand::tilde(&self.output.path).as_ref());
        if expanded.is_absolute() {
            return Ok(expanded);
        }
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        Ok(cwd.join(expanded))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relays.connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.relays.query_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule.cycle_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_minutes * 60)
    }
}
