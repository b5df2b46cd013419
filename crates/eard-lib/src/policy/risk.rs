//! Risk escalation ladder
//!
//! The recorded risk is a bitmask of {WARNING1, WARNING2, PANIC} per
//! domain. Levels are cumulative in the mask: WARNING2 also sets WARNING1
//! and PANIC sets all three bits of its domain. The level of a domain is
//! the highest bit present, whatever the mask was set from.

use std::collections::VecDeque;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::powercap::PowercapDomain;
use crate::config::{NodeConf, RiskConfig};

bitflags! {
    /// Risk flags of both domains
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RiskState: u8 {
        const WARNING1_ENERGY = 0x01;
        const WARNING2_ENERGY = 0x02;
        const PANIC_ENERGY = 0x04;
        const WARNING1_POWER = 0x08;
        const WARNING2_POWER = 0x10;
        const PANIC_POWER = 0x20;
    }
}

impl RiskState {
    /// Build a mask from raw wire bits, dropping undefined ones
    pub fn from_raw(bits: u8) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// Flags of one domain
    pub fn domain_mask(domain: PowercapDomain) -> Self {
        match domain {
            PowercapDomain::Energy => {
                Self::WARNING1_ENERGY | Self::WARNING2_ENERGY | Self::PANIC_ENERGY
            }
            PowercapDomain::Power => {
                Self::WARNING1_POWER | Self::WARNING2_POWER | Self::PANIC_POWER
            }
        }
    }
}

/// Escalation level of one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Warning1,
    Warning2,
    Panic,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Warning1 => "warning1",
            RiskLevel::Warning2 => "warning2",
            RiskLevel::Panic => "panic",
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    fn up(self) -> Self {
        match self {
            RiskLevel::None => RiskLevel::Warning1,
            RiskLevel::Warning1 => RiskLevel::Warning2,
            RiskLevel::Warning2 | RiskLevel::Panic => RiskLevel::Panic,
        }
    }

    fn down(self) -> Self {
        match self {
            RiskLevel::None | RiskLevel::Warning1 => RiskLevel::None,
            RiskLevel::Warning2 => RiskLevel::Warning1,
            RiskLevel::Panic => RiskLevel::Warning2,
        }
    }

    /// Level a reading of `percent` of the domain limit asks for
    pub fn for_percent(percent: f64, config: &RiskConfig) -> Self {
        if percent >= config.panic_pct {
            RiskLevel::Panic
        } else if percent >= config.warning2_pct {
            RiskLevel::Warning2
        } else if percent >= config.warning1_pct {
            RiskLevel::Warning1
        } else {
            RiskLevel::None
        }
    }

    /// Cumulative flags of this level in `domain`
    pub fn flags(self, domain: PowercapDomain) -> RiskState {
        let (w1, w2, panic) = match domain {
            PowercapDomain::Energy => (
                RiskState::WARNING1_ENERGY,
                RiskState::WARNING2_ENERGY,
                RiskState::PANIC_ENERGY,
            ),
            PowercapDomain::Power => (
                RiskState::WARNING1_POWER,
                RiskState::WARNING2_POWER,
                RiskState::PANIC_POWER,
            ),
        };
        match self {
            RiskLevel::None => RiskState::empty(),
            RiskLevel::Warning1 => w1,
            RiskLevel::Warning2 => w1 | w2,
            RiskLevel::Panic => w1 | w2 | panic,
        }
    }

    /// Highest level present in `mask` for `domain`
    pub fn from_mask(mask: RiskState, domain: PowercapDomain) -> Self {
        [RiskLevel::Panic, RiskLevel::Warning2, RiskLevel::Warning1]
            .into_iter()
            .find(|level| {
                let top = level.flags(domain) - level.down().flags(domain);
                mask.intersects(top)
            })
            .unwrap_or(RiskLevel::None)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed one-step change of a domain level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskTransition {
    pub domain: PowercapDomain,
    pub from: RiskLevel,
    pub to: RiskLevel,
}

/// Hysteresis counters of one domain
#[derive(Debug, Clone, Copy, Default)]
struct RiskLadder {
    pending_up: u32,
    pending_down: u32,
}

impl RiskLadder {
    fn clear(&mut self) {
        self.pending_up = 0;
        self.pending_down = 0;
    }

    /// Count one sample and return the level to move to, if confirmed
    fn observe(&mut self, current: RiskLevel, wanted: RiskLevel, samples: u32) -> Option<RiskLevel> {
        if wanted > current {
            self.pending_down = 0;
            self.pending_up += 1;
            if self.pending_up >= samples {
                self.pending_up = 0;
                return Some(current.up());
            }
        } else if wanted < current {
            self.pending_up = 0;
            self.pending_down += 1;
            if self.pending_down >= samples {
                self.pending_down = 0;
                return Some(current.down());
            }
        } else {
            self.clear();
        }
        None
    }
}

/// Rolling sum of energy samples over a fixed time window
#[derive(Debug, Clone, Default)]
pub struct EnergyWindow {
    samples: VecDeque<(i64, u64)>,
    total_mj: u64,
}

impl EnergyWindow {
    pub fn push(&mut self, timestamp: i64, energy_mj: u64, window_secs: u64) {
        self.samples.push_back((timestamp, energy_mj));
        self.total_mj = self.total_mj.saturating_add(energy_mj);

        let horizon = timestamp.saturating_sub(window_secs as i64);
        while let Some(&(ts, mj)) = self.samples.front() {
            if ts > horizon {
                break;
            }
            self.samples.pop_front();
            self.total_mj = self.total_mj.saturating_sub(mj);
        }
    }

    pub fn energy_j(&self) -> f64 {
        self.total_mj as f64 / 1000.0
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.total_mj = 0;
    }
}

/// Corrective action derived from the current risk
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskAction {
    /// Highest frequency the node may run at, in kHz
    pub freq_ceiling: u64,
    /// Hard power limit to program, only at POWER panic
    pub hard_power_cap: Option<f64>,
}

/// Risk mask plus per-domain hysteresis
#[derive(Debug, Clone)]
pub struct RiskEngine {
    mask: RiskState,
    energy: RiskLadder,
    power: RiskLadder,
    config: RiskConfig,
    window: EnergyWindow,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            mask: RiskState::empty(),
            energy: RiskLadder::default(),
            power: RiskLadder::default(),
            config,
            window: EnergyWindow::default(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RiskConfig) {
        self.config = config;
        self.energy.clear();
        self.power.clear();
    }

    pub fn state(&self) -> RiskState {
        self.mask
    }

    pub fn add_risk(&mut self, flags: RiskState) {
        self.mask |= flags;
        self.clear_pending();
    }

    pub fn del_risk(&mut self, flags: RiskState) {
        self.mask &= !flags;
        self.clear_pending();
    }

    pub fn set_risk(&mut self, flags: RiskState) {
        self.mask = flags;
        self.clear_pending();
    }

    pub fn is_risk_set(&self, flags: RiskState) -> bool {
        self.mask.contains(flags)
    }

    pub fn level(&self, domain: PowercapDomain) -> RiskLevel {
        RiskLevel::from_mask(self.mask, domain)
    }

    /// Feed one reading as a percentage of the domain limit
    pub fn observe(&mut self, domain: PowercapDomain, percent: f64) -> Option<RiskTransition> {
        let current = self.level(domain);
        let wanted = RiskLevel::for_percent(percent, &self.config);
        let samples = self.config.hysteresis_samples.max(1);

        let ladder = match domain {
            PowercapDomain::Energy => &mut self.energy,
            PowercapDomain::Power => &mut self.power,
        };
        let next = ladder.observe(current, wanted, samples)?;

        self.mask = (self.mask - RiskState::domain_mask(domain)) | next.flags(domain);
        Some(RiskTransition {
            domain,
            from: current,
            to: next,
        })
    }

    /// Account an energy sample and return the window total in joules
    pub fn record_energy(&mut self, timestamp: i64, energy_mj: u64, window_secs: u64) -> f64 {
        self.window.push(timestamp, energy_mj, window_secs);
        self.window.energy_j()
    }

    /// Frequency ceiling and hard cap for the current mask
    pub fn action(&self, node: &NodeConf, power_limit: Option<f64>) -> RiskAction {
        let max = node.max_freq();
        let min = node.min_freq();
        let range = max.saturating_sub(min) as f64;

        let worst = self.level(PowercapDomain::Energy).max(self.level(PowercapDomain::Power));
        let freq_ceiling = match worst {
            RiskLevel::None => max,
            RiskLevel::Warning1 => max - (range * self.config.warning1_penalty).round() as u64,
            RiskLevel::Warning2 => max - (range * self.config.warning2_penalty).round() as u64,
            RiskLevel::Panic => min,
        };

        let hard_power_cap = if self.level(PowercapDomain::Power) == RiskLevel::Panic {
            power_limit
        } else {
            None
        };

        RiskAction {
            freq_ceiling: freq_ceiling.max(min),
            hard_power_cap,
        }
    }

    /// Forget all risk, as when the last job ends
    pub fn reset(&mut self) {
        self.mask = RiskState::empty();
        self.clear_pending();
        self.window.clear();
    }

    fn clear_pending(&mut self) {
        self.energy.clear();
        self.power.clear();
    }
}
