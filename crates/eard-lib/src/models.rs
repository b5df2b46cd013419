//! Core data models shared by the daemon components

use serde::{Deserialize, Serialize};

use crate::error::{EardError, Result};

/// Number of scheduling policies every node carries a configuration for
pub const TOTAL_POLICIES: usize = 3;

/// Energy policy applied to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Lowest energy within a bounded time penalty
    MinEnergy,
    /// Raise frequency while the speedup pays off
    MinTime,
    /// Run at the configured frequency and only observe
    Monitoring,
}

impl Policy {
    pub const ALL: [Policy; TOTAL_POLICIES] =
        [Policy::MinEnergy, Policy::MinTime, Policy::Monitoring];

    /// Slot of this policy in a `policy_conf` array
    pub fn index(&self) -> usize {
        match self {
            Policy::MinEnergy => 0,
            Policy::MinTime => 1,
            Policy::Monitoring => 2,
        }
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| EardError::invalid(format!("unknown policy index {}", index)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::MinEnergy => "min_energy",
            Policy::MinTime => "min_time",
            Policy::Monitoring => "monitoring",
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Monitoring
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-policy frequency and threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConf {
    /// Default frequency in kHz
    pub freq: u64,
    /// Policy threshold (time penalty or minimum speedup ratio)
    pub th: f64,
}

/// Node-level readings attached to a status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub avg_freq: u64,
    pub temp: f64,
    pub power: f64,
    pub max_freq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppInfo {
    pub job_id: u64,
    pub step_id: u64,
}

/// Status of one monitored node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    pub ip: String,
    pub ok: bool,
    pub policy_conf: [PolicyConf; TOTAL_POLICIES],
    pub node_info: NodeInfo,
    pub app_info: AppInfo,
}

/// One periodic sample from the metrics backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Unix timestamp of the sample in seconds
    pub timestamp: i64,
    /// Energy consumed since the previous sample
    pub energy_mj: u64,
    pub power_w: f64,
    pub temperature: f64,
    /// Average CPU frequency over the sample in kHz
    pub frequency: u64,
}

impl NodeMetrics {
    pub fn energy_j(&self) -> f64 {
        self.energy_mj as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_index_round_trip() {
        for policy in Policy::ALL {
            assert_eq!(Policy::from_index(policy.index()).unwrap(), policy);
        }
        assert!(Policy::from_index(TOTAL_POLICIES).is_err());
    }

    #[test]
    fn test_app_status_serializes_all_policy_slots() {
        let status = AppStatus {
            ip: "10.0.0.7".to_string(),
            ok: true,
            ..Default::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["policy_conf"].as_array().unwrap().len(), TOTAL_POLICIES);

        let back: AppStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_policy_wire_names() {
        assert_eq!(serde_json::to_string(&Policy::MinEnergy).unwrap(), "\"min_energy\"");
        let p: Policy = serde_json::from_str("\"min_time\"").unwrap();
        assert_eq!(p, Policy::MinTime);
    }
}
