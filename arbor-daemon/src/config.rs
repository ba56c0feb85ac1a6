//! Layered worker configuration.
//!
//! Sources, lowest to highest precedence: serde defaults, the optional
//! file named by `-c`, then `ARBOR__`-prefixed environment variables.
//! Every value has a default; the file may be absent entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use arbor_core::WorkerRole;

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// monitor, trader, or both.
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub sink: SinkSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub intervals: IntervalSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Per-venue REST credentials for the trader role, keyed by venue
    /// name.
    #[serde(default)]
    pub venues: HashMap<String, VenueConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkSettings {
    #[serde(default = "default_sink_root")]
    pub root: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval")]
    pub batch_interval_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamSettings {
    #[serde(default = "default_max_pairs")]
    pub max_pairs_per_session: usize,
    #[serde(default = "default_close_grace")]
    pub close_grace_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntervalSettings {
    #[serde(default = "default_task_poll")]
    pub task_poll_sec: u64,
    #[serde(default = "default_arbitrage_poll")]
    pub arbitrage_poll_sec: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_sec: i64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VenueConfig {
    pub rest_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

impl DaemonConfig {
    /// Parse the configured role string; invalid combinations are a
    /// startup-fatal config error.
    pub fn worker_role(&self) -> Result<WorkerRole> {
        WorkerRole::from_str(&self.role)
            .map_err(|err| anyhow::anyhow!("invalid role in config: {err}"))
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            connect_timeout_sec: default_connect_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            root: default_sink_root(),
            batch_size: default_batch_size(),
            batch_interval_sec: default_batch_interval(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_pairs_per_session: default_max_pairs(),
            close_grace_sec: default_close_grace(),
        }
    }
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            task_poll_sec: default_task_poll(),
            arbitrage_poll_sec: default_arbitrage_poll(),
            heartbeat_timeout_sec: default_heartbeat_timeout(),
            shutdown_grace_sec: default_shutdown_grace(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_role() -> String {
    "monitor".to_string()
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("data/catalog.db")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_sink_root() -> PathBuf {
    PathBuf::from("data/orderbooks")
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_interval() -> u64 {
    5
}

fn default_max_pairs() -> usize {
    40
}

fn default_close_grace() -> u64 {
    30
}

fn default_task_poll() -> u64 {
    5
}

fn default_arbitrage_poll() -> u64 {
    1
}

fn default_heartbeat_timeout() -> i64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9205".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state/arbor.state")
}

/// Load configuration, tolerating a missing file.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix("ARBOR")
            .separator("__")
            .ignore_empty(true),
    );
    let config = builder.build().context("failed to assemble configuration")?;
    config
        .try_deserialize()
        .context("failed to deserialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn absent_file_yields_full_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.worker_role().unwrap(), WorkerRole::Monitor);
        assert_eq!(config.stream.max_pairs_per_session, 40);
        assert_eq!(config.intervals.task_poll_sec, 5);
        assert_eq!(config.intervals.shutdown_grace_sec, 30);
        assert!(config.venues.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            role = "both"

            [stream]
            max_pairs_per_session = 10

            [venues.binance]
            rest_url = "https://api.binance.com"
            api_key = "k"
            api_secret = "s"
            "#
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.worker_role().unwrap(), WorkerRole::Both);
        assert_eq!(config.stream.max_pairs_per_session, 10);
        assert_eq!(
            config.venues.get("binance").unwrap().rest_url,
            "https://api.binance.com"
        );
        // Untouched sections keep defaults.
        assert_eq!(config.intervals.arbitrage_poll_sec, 1);
    }

    #[test]
    fn invalid_role_is_fatal() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, r#"role = "overlord""#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert!(config.worker_role().is_err());
    }
}
