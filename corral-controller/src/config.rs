//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of the cluster managed by this controller.
    pub cluster_name: String,
    /// The name of this controller instance, used as its leadership identity.
    pub controller_name: String,

    /// The path to the coordination store on disk.
    #[serde(default = "Config::default_storage_data_path")]
    pub storage_data_path: String,
    /// The port used for serving metrics and healthchecks.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The maximum delay between rebalance passes.
    #[serde(default = "Config::default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
    /// The interval between convergence checks.
    #[serde(default = "Config::default_verify_interval_ms")]
    pub verify_interval_ms: u64,
    /// The interval between assignment reports.
    #[serde(default = "Config::default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// The duration in seconds for which a lease is considered held.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: u32,
    /// The duration that a lease holder will wait between lease renewals.
    #[serde(default = "Config::default_lease_renew_seconds")]
    pub lease_renew_seconds: u32,

    /// Nodes hosted by this process, participating through the in-process transport.
    #[serde(default)]
    pub local_nodes: Vec<String>,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.cluster_name.is_empty(), "CLUSTER_NAME must not be empty");
        ensure!(!self.controller_name.is_empty(), "CONTROLLER_NAME must not be empty");
        ensure!(
            self.lease_duration_seconds > self.lease_renew_seconds,
            "LEASE_DURATION_SECONDS must be greater than LEASE_RENEW_SECONDS"
        );
        ensure!(self.lease_renew_seconds >= 1, "LEASE_RENEW_SECONDS must be at least 1 second");
        ensure!(self.rebalance_interval_ms >= 1, "REBALANCE_INTERVAL_MS must be at least 1");
        ensure!(self.verify_interval_ms >= 1, "VERIFY_INTERVAL_MS must be at least 1");
        ensure!(self.report_interval_ms >= 1, "REPORT_INTERVAL_MS must be at least 1");
        Ok(())
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    fn default_storage_data_path() -> String {
        "/usr/local/corral/data".into()
    }

    fn default_metrics_port() -> u16 {
        9090
    }

    fn default_rebalance_interval_ms() -> u64 {
        5_000
    }

    fn default_verify_interval_ms() -> u64 {
        30_000
    }

    fn default_report_interval_ms() -> u64 {
        60_000
    }

    fn default_lease_duration_seconds() -> u32 {
        30
    }

    fn default_lease_renew_seconds() -> u32 {
        10
    }
}
