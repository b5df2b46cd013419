//! Typed configuration handed to the daemon core
//!
//! The core never reads files or the environment; the binary loads these
//! structures and passes them in.

use serde::{Deserialize, Serialize};

use crate::dynais::DetectorConfig;
use crate::error::{EardError, Result};
use crate::lock::LockConfig;
use crate::models::{Policy, PolicyConf, TOTAL_POLICIES};

/// Everything the core needs to start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub node: NodeConf,
    pub cluster: ClusterConf,
    pub detector: DetectorConfig,
    pub lock: LockConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.cluster.validate()?;
        self.detector.validate()
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConf {
    /// Name or address this node reports its status under
    pub hostname: String,
    /// Available CPU frequencies in kHz, highest first
    pub frequencies: Vec<u64>,
    /// Policy applied to jobs that do not request one
    pub default_policy: Policy,
    pub policy_conf: [PolicyConf; TOTAL_POLICIES],
    /// Node power budget in watts
    pub max_power_w: Option<f64>,
    /// Node energy budget in joules per accounting window
    pub max_energy_j: Option<f64>,
}

impl Default for NodeConf {
    fn default() -> Self {
        let frequencies = vec![
            2_400_000, 2_200_000, 2_000_000, 1_800_000, 1_600_000, 1_400_000, 1_200_000,
            1_000_000,
        ];
        let nominal = frequencies[0];

        Self {
            hostname: "localhost".to_string(),
            frequencies,
            default_policy: Policy::Monitoring,
            policy_conf: [
                PolicyConf {
                    freq: nominal,
                    th: 0.05,
                },
                PolicyConf {
                    freq: 2_000_000,
                    th: 0.70,
                },
                PolicyConf {
                    freq: nominal,
                    th: 0.0,
                },
            ],
            max_power_w: None,
            max_energy_j: None,
        }
    }
}

impl NodeConf {
    /// Highest available frequency
    pub fn max_freq(&self) -> u64 {
        self.frequencies.iter().copied().max().unwrap_or(0)
    }

    /// Lowest available frequency
    pub fn min_freq(&self) -> u64 {
        self.frequencies.iter().copied().min().unwrap_or(0)
    }

    /// Snap a requested frequency to the highest available one not above it
    ///
    /// Requests below the range snap to the minimum.
    pub fn snap_freq(&self, khz: u64) -> u64 {
        self.frequencies
            .iter()
            .copied()
            .filter(|f| *f <= khz)
            .max()
            .unwrap_or_else(|| self.min_freq())
    }

    pub fn policy(&self, policy: Policy) -> PolicyConf {
        self.policy_conf[policy.index()]
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequencies.is_empty() || self.frequencies.contains(&0) {
            return Err(EardError::invalid("node frequency list must be non-empty and non-zero"));
        }
        if self.frequencies.windows(2).any(|w| w[0] <= w[1]) {
            return Err(EardError::invalid("node frequencies must be strictly descending"));
        }
        for policy in Policy::ALL {
            let conf = self.policy(policy);
            if !conf.th.is_finite() || conf.th < 0.0 {
                return Err(EardError::invalid(format!("threshold of {} must be >= 0", policy)));
            }
        }
        for (name, limit) in [("max_power_w", self.max_power_w), ("max_energy_j", self.max_energy_j)] {
            if let Some(v) = limit {
                if !v.is_finite() || v <= 0.0 {
                    return Err(EardError::invalid(format!("{} must be positive", name)));
                }
            }
        }
        Ok(())
    }
}

/// Thresholds and penalties of the risk ladder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Percent of the domain limit that enters WARNING1
    pub warning1_pct: f64,
    pub warning2_pct: f64,
    pub panic_pct: f64,
    /// Consecutive samples a new level must persist before it is taken
    pub hysteresis_samples: u32,
    /// Fraction of the frequency range removed at WARNING1
    pub warning1_penalty: f64,
    pub warning2_penalty: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            warning1_pct: 85.0,
            warning2_pct: 90.0,
            panic_pct: 95.0,
            hysteresis_samples: 3,
            warning1_penalty: 0.05,
            warning2_penalty: 0.10,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 < self.warning1_pct
            && self.warning1_pct < self.warning2_pct
            && self.warning2_pct < self.panic_pct;
        if !ordered {
            return Err(EardError::invalid(
                "risk thresholds must satisfy 0 < warning1 < warning2 < panic",
            ));
        }
        if self.hysteresis_samples == 0 {
            return Err(EardError::invalid("hysteresis_samples must be at least 1"));
        }
        let penalties_ok = (0.0..=1.0).contains(&self.warning1_penalty)
            && (0.0..=1.0).contains(&self.warning2_penalty)
            && self.warning1_penalty <= self.warning2_penalty;
        if !penalties_ok {
            return Err(EardError::invalid(
                "warning penalties must lie in [0, 1] with warning1 <= warning2",
            ));
        }
        Ok(())
    }
}

/// Cluster-wide settings pushed to every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConf {
    pub risk: RiskConfig,
    /// Length of the rolling energy accounting window
    pub energy_window_secs: u64,
    /// Relative CPI/GBS change that triggers a new frequency selection
    pub signature_change_threshold: f64,
}

impl Default for ClusterConf {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            energy_window_secs: 60,
            signature_change_threshold: 0.2,
        }
    }
}

impl ClusterConf {
    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;
        if self.energy_window_secs == 0 {
            return Err(EardError::invalid("energy_window_secs must be positive"));
        }
        if !self.signature_change_threshold.is_finite() || self.signature_change_threshold < 0.0 {
            return Err(EardError::invalid("signature_change_threshold must be >= 0"));
        }
        Ok(())
    }
}
