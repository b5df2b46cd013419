//! Performance signatures and frequency selection
//!
//! A [`Signature`] is the CPI/bandwidth profile measured for one detected
//! phase at the frequency it ran at. A [`PerformanceModel`] projects that
//! phase's time and power to other frequencies; the policies pick a
//! frequency from those projections.

use serde::{Deserialize, Serialize};

use crate::config::NodeConf;
use crate::models::{Policy, PolicyConf};

/// Measured profile of one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Cycles per instruction
    pub cpi: f64,
    /// Memory bandwidth in GB/s
    pub gbs: f64,
    /// Memory transactions per instruction
    pub tpi: f64,
    /// Seconds per iteration
    pub time: f64,
    /// Average DC node power in watts
    pub power: f64,
    /// Average frequency the signature was measured at, in kHz
    pub avg_freq: u64,
}

impl Signature {
    /// Whether CPI or GBS moved by more than `threshold` relative to `previous`
    pub fn differs(&self, previous: &Signature, threshold: f64) -> bool {
        relative_change(self.cpi, previous.cpi) > threshold
            || relative_change(self.gbs, previous.gbs) > threshold
    }
}

fn relative_change(current: f64, previous: f64) -> f64 {
    let delta = (current - previous).abs();
    if previous.abs() < f64::EPSILON {
        delta
    } else {
        delta / previous.abs()
    }
}

/// Projects a signature to another frequency
pub trait PerformanceModel: Send + Sync {
    fn project_time(&self, signature: &Signature, freq: u64) -> f64;

    fn project_power(&self, signature: &Signature, freq: u64) -> f64;

    fn project_energy(&self, signature: &Signature, freq: u64) -> f64 {
        self.project_time(signature, freq) * self.project_power(signature, freq)
    }
}

/// Memory-boundness model
///
/// The fraction of the runtime that is memory bound (bandwidth over the
/// saturation bandwidth) does not scale with frequency; the rest scales
/// inversely. Power has a static part and a part linear in frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub static_power_fraction: f64,
    pub saturation_gbs: f64,
}

impl Default for LinearModel {
    fn default() -> Self {
        Self {
            static_power_fraction: 0.3,
            saturation_gbs: 50.0,
        }
    }
}

impl LinearModel {
    fn memory_bound(&self, signature: &Signature) -> f64 {
        if self.saturation_gbs <= 0.0 {
            return 0.0;
        }
        (signature.gbs / self.saturation_gbs).clamp(0.0, 1.0)
    }
}

impl PerformanceModel for LinearModel {
    fn project_time(&self, signature: &Signature, freq: u64) -> f64 {
        if signature.avg_freq == 0 || freq == 0 {
            return signature.time;
        }
        let ratio = signature.avg_freq as f64 / freq as f64;
        let mem = self.memory_bound(signature);
        signature.time * (mem + (1.0 - mem) * ratio)
    }

    fn project_power(&self, signature: &Signature, freq: u64) -> f64 {
        if signature.avg_freq == 0 || freq == 0 {
            return signature.power;
        }
        let ratio = freq as f64 / signature.avg_freq as f64;
        let fixed = self.static_power_fraction.clamp(0.0, 1.0);
        signature.power * (fixed + (1.0 - fixed) * ratio)
    }
}

/// Frequency `policy` selects for `signature` on `node`
pub fn select_frequency(
    policy: Policy,
    conf: PolicyConf,
    signature: &Signature,
    node: &NodeConf,
    model: &dyn PerformanceModel,
) -> u64 {
    let base = node.snap_freq(conf.freq);

    match policy {
        Policy::Monitoring => base,
        Policy::MinEnergy => {
            let time_limit = model.project_time(signature, base) * (1.0 + conf.th);
            let mut best = (base, model.project_energy(signature, base));

            for &freq in node.frequencies.iter().filter(|&&f| f < base) {
                if model.project_time(signature, freq) > time_limit {
                    continue;
                }
                let energy = model.project_energy(signature, freq);
                if energy < best.1 {
                    best = (freq, energy);
                }
            }
            best.0
        }
        Policy::MinTime => {
            let mut ascending: Vec<u64> =
                node.frequencies.iter().copied().filter(|&f| f > base).collect();
            ascending.sort_unstable();

            let mut current = base;
            for next in ascending {
                let t_current = model.project_time(signature, current);
                let t_next = model.project_time(signature, next);
                if t_current <= 0.0 {
                    break;
                }
                let time_gain = (t_current - t_next) / t_current;
                let freq_gain = (next - current) as f64 / current as f64;
                if time_gain < conf.th * freq_gain {
                    break;
                }
                current = next;
            }
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(gbs: f64) -> Signature {
        Signature {
            cpi: 0.8,
            gbs,
            tpi: 0.1,
            time: 1.0,
            power: 300.0,
            avg_freq: 2_400_000,
        }
    }

    #[test]
    fn test_differs_uses_relative_change() {
        let base = signature(10.0);
        let mut next = base;
        next.cpi = 0.9;
        assert!(!next.differs(&base, 0.2));

        next.gbs = 13.0;
        assert!(next.differs(&base, 0.2));
    }

    #[test]
    fn test_linear_model_projections() {
        let model = LinearModel::default();
        let cpu = signature(0.0);
        assert!((model.project_time(&cpu, 1_200_000) - 2.0).abs() < 1e-9);
        assert!((model.project_power(&cpu, 1_200_000) - 195.0).abs() < 1e-9);

        let mem = signature(80.0);
        assert!((model.project_time(&mem, 1_200_000) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_min_energy_lowers_memory_bound_phase() {
        let node = NodeConf::default();
        let conf = node.policy(Policy::MinEnergy);
        let freq = select_frequency(
            Policy::MinEnergy,
            conf,
            &signature(80.0),
            &node,
            &LinearModel::default(),
        );
        assert_eq!(freq, node.min_freq());
    }

    #[test]
    fn test_min_energy_keeps_compute_bound_phase() {
        let node = NodeConf::default();
        let conf = node.policy(Policy::MinEnergy);
        let freq = select_frequency(
            Policy::MinEnergy,
            conf,
            &signature(0.0),
            &node,
            &LinearModel::default(),
        );
        assert_eq!(freq, 2_400_000);
    }

    #[test]
    fn test_min_time_raises_only_when_it_pays() {
        let node = NodeConf::default();
        let conf = node.policy(Policy::MinTime);
        let model = LinearModel::default();

        let cpu = select_frequency(Policy::MinTime, conf, &signature(0.0), &node, &model);
        assert_eq!(cpu, 2_400_000);

        let mem = select_frequency(Policy::MinTime, conf, &signature(80.0), &node, &model);
        assert_eq!(mem, 2_000_000);
    }

    #[test]
    fn test_monitoring_uses_configured_frequency() {
        let node = NodeConf::default();
        let conf = PolicyConf {
            freq: 1_900_000,
            th: 0.0,
        };
        let freq = select_frequency(
            Policy::Monitoring,
            conf,
            &signature(0.0),
            &node,
            &LinearModel::default(),
        );
        assert_eq!(freq, 1_800_000);
    }
}
