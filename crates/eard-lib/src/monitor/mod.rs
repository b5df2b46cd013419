//! Periodic node metrics sampling
//!
//! A [`MetricsProvider`] yields the node's power and energy readings; the
//! [`MonitorLoop`] polls it at a fixed interval and feeds every sample to the
//! policy engine's risk evaluation.

mod r#loop;

pub use r#loop::{MonitorConfig, MonitorLoop, MonitorLoopBuilder, TickOutcome};

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{EardError, Result};
use crate::models::NodeMetrics;

/// Source of node metrics
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Latest sample, `None` when nothing new arrived since the last call
    async fn sample(&self) -> anyhow::Result<Option<NodeMetrics>>;
}

/// Metrics pushed by external backends over the wire
///
/// Reports arriving between two polls are merged: energy deltas add up,
/// instantaneous readings keep the newest value.
#[derive(Debug, Default)]
pub struct ReportedMetrics {
    pending: Mutex<Option<NodeMetrics>>,
}

impl ReportedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, report: NodeMetrics) -> Result<()> {
        if !report.power_w.is_finite() || report.power_w < 0.0 {
            return Err(EardError::invalid(format!("invalid power reading {}", report.power_w)));
        }

        let mut pending = self.pending.lock().map_err(|_| EardError::LockPoisoned)?;
        let merged = match pending.take() {
            Some(previous) => NodeMetrics {
                energy_mj: previous.energy_mj.saturating_add(report.energy_mj),
                ..report
            },
            None => report,
        };
        *pending = Some(merged);
        Ok(())
    }

    pub fn take(&self) -> Result<Option<NodeMetrics>> {
        let mut pending = self.pending.lock().map_err(|_| EardError::LockPoisoned)?;
        Ok(pending.take())
    }
}

#[async_trait]
impl MetricsProvider for ReportedMetrics {
    async fn sample(&self) -> anyhow::Result<Option<NodeMetrics>> {
        Ok(self.take()?)
    }
}
