//! Actuation seam towards the frequency and power controllers

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use super::powercap::PowercapDomain;
use crate::error::Result;

/// External frequency/power controller
///
/// The core never programs hardware itself; every decision goes through
/// this trait. Failures are reported as `ActuationFailure`.
pub trait Actuator: Send + Sync {
    fn set_cpu_frequency(&self, khz: u64) -> Result<()>;

    fn set_power_limit(&self, domain: PowercapDomain, watts: f64) -> Result<()>;

    /// Remove a limit programmed with `set_power_limit`
    fn clear_power_limit(&self, domain: PowercapDomain) -> Result<()>;
}

/// Actuator that only logs what it would do
#[derive(Debug, Default)]
pub struct DryRunActuator {
    last_freq: AtomicU64,
    requests: AtomicU64,
}

impl DryRunActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last frequency requested, 0 when none
    pub fn last_frequency(&self) -> u64 {
        self.last_freq.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Actuator for DryRunActuator {
    fn set_cpu_frequency(&self, khz: u64) -> Result<()> {
        self.last_freq.store(khz, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
        info!(freq_khz = khz, "dry-run: set CPU frequency");
        Ok(())
    }

    fn set_power_limit(&self, domain: PowercapDomain, watts: f64) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        info!(domain = %domain, watts, "dry-run: set power limit");
        Ok(())
    }

    fn clear_power_limit(&self, domain: PowercapDomain) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        info!(domain = %domain, "dry-run: clear power limit");
        Ok(())
    }
}
