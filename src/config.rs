//! Runtime configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::models::{ExecutorId, Units};

/// The default interval at which the planner wakes up without new stream data.
pub(crate) const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
/// The default number of clock ticks a failed delta waits before being planned again.
pub(crate) const DEFAULT_FAILURE_BACKOFF_TICKS: u64 = 30_000;
/// The default number of clock ticks for which the task stream writer lease is held.
pub(crate) const DEFAULT_LEASE_DURATION_TICKS: u64 = 15_000;
/// The default max number of records consumed from each stream per planning cycle.
pub(crate) const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// A desired state document, mapping executors to the units they should have installed.
pub type DesiredState = BTreeMap<ExecutorId, Units>;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The identity of this planner instance.
    ///
    /// Used as the producer of all tasks emitted by this planner, and as the holder identity of
    /// the task stream's writer lease.
    pub planner_executor_id: ExecutorId,
    /// The port used to serve Prometheus metrics and the desired state API.
    pub http_port: u16,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The interval in milliseconds at which the planner is woken up without new stream data.
    #[serde(default = "Config::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// The number of clock ticks a failed delta must wait before it is planned again.
    #[serde(default = "Config::default_failure_backoff_ticks")]
    pub failure_backoff_ticks: u64,
    /// The number of clock ticks for which the task stream writer lease is held once acquired.
    #[serde(default = "Config::default_lease_duration_ticks")]
    pub lease_duration_ticks: u64,
    /// The max number of records consumed from each stream per planning cycle.
    #[serde(default = "Config::default_max_batch_size")]
    pub max_batch_size: usize,
    /// An optional path to a JSON desired state document used to seed the planner on startup.
    #[serde(default)]
    pub desired_state_path: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()
    }

    /// Validate the relationships between config values.
    pub fn validate(self) -> Result<Self> {
        ensure!(self.tick_interval_ms > 0, "TICK_INTERVAL_MS must be greater than 0");
        ensure!(self.max_batch_size > 0, "MAX_BATCH_SIZE must be greater than 0");
        ensure!(
            self.lease_duration_ticks > self.tick_interval_ms,
            "LEASE_DURATION_TICKS ({}) must be greater than TICK_INTERVAL_MS ({}) so that the lease is renewed before it expires",
            self.lease_duration_ticks,
            self.tick_interval_ms,
        );
        Ok(self)
    }

    /// The interval at which the planner is woken up without new stream data.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Load the desired state document from the configured path, if any.
    pub async fn load_desired_state(&self) -> Result<Option<DesiredState>> {
        let path = match &self.desired_state_path {
            Some(path) => path,
            None => return Ok(None),
        };
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("error reading desired state document at {}", path))?;
        let desired: DesiredState = serde_json::from_slice(&bytes).with_context(|| format!("error parsing desired state document at {}", path))?;
        Ok(Some(desired))
    }

    fn default_tick_interval_ms() -> u64 {
        DEFAULT_TICK_INTERVAL_MS
    }

    fn default_failure_backoff_ticks() -> u64 {
        DEFAULT_FAILURE_BACKOFF_TICKS
    }

    fn default_lease_duration_ticks() -> u64 {
        DEFAULT_LEASE_DURATION_TICKS
    }

    fn default_max_batch_size() -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
}

#[cfg(test)]
impl Config {
    /// Create a config for tests, backed by a temporary storage directory.
    ///
    /// The returned `TempDir` must be held for as long as the config is in use.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test config")?;
        let config = Self {
            rust_log: "error".into(),
            planner_executor_id: ExecutorId::new("grid://planners/test")?,
            http_port: 7002,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            tick_interval_ms: 10,
            failure_backoff_ticks: 100,
            lease_duration_ticks: 1_000,
            max_batch_size: 50,
            desired_state_path: None,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
