//! Daemon configuration
//!
//! Read from an optional file named by `EARD_CONFIG`, then overridden by
//! `EARD_*` environment variables; nested keys use `__`, e.g.
//! `EARD_CORE__CLUSTER__RISK__HYSTERESIS_SAMPLES=5`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use eard_lib::config::CoreConfig;
use serde::Deserialize;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EardConfig {
    /// Unix socket clients connect to
    pub socket_path: PathBuf,

    /// Listen address of the health/metrics HTTP API
    pub api_addr: String,

    /// Where the checkpoint is kept across restarts
    pub checkpoint_path: PathBuf,

    /// Metrics sampling interval in milliseconds
    pub monitor_interval_ms: u64,

    /// Node status entries not refreshed for this long are dropped
    pub status_max_age_secs: u64,

    pub core: CoreConfig,
}

impl Default for EardConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/eard/eard.sock"),
            api_addr: "0.0.0.0:8080".to_string(),
            checkpoint_path: PathBuf::from("/var/lib/eard/eard.ckpt"),
            monitor_interval_ms: 1000,
            status_max_age_secs: 300,
            core: CoreConfig::default(),
        }
    }
}

impl EardConfig {
    /// Load configuration from the file named by `EARD_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os("EARD_CONFIG").map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("EARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EardConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_ms == 0 {
            anyhow::bail!("monitor_interval_ms must be positive");
        }
        self.core.validate().context("Invalid core configuration")?;
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn status_max_age(&self) -> Duration {
        Duration::from_secs(self.status_max_age_secs)
    }
}
