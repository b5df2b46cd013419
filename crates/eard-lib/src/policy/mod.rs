//! Frequency policies, powercaps and risk escalation
//!
//! The [`PolicyEngine`] turns loop events reported by applications and the
//! periodic node metrics into frequency and power-limit requests. Decisions
//! are made under the shared state lock; the actuator is called after the
//! lock is released, so a slow or failing controller never blocks other
//! clients and never leaves the recorded state half-updated.

mod actuator;
mod engine;
mod model;
mod powercap;
mod risk;


pub use actuator::{Actuator, DryRunActuator};
pub use engine::{MetricsOutcome, NewJob, PolicyEngine};
pub use model::{select_frequency, LinearModel, PerformanceModel, Signature};
pub use powercap::{effective_limit, Powercap, PowercapDomain, PowercapRequest};
pub use risk::{EnergyWindow, RiskAction, RiskEngine, RiskLevel, RiskState, RiskTransition};

use serde::{Deserialize, Serialize};

use crate::dynais::LoopEvent;
use crate::models::{AppInfo, Policy};

/// An application managed on this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedApp {
    pub pid: u32,
    pub job: AppInfo,
    pub policy: Policy,
    /// Frequency the policy selected for the current phase, in kHz
    pub freq: u64,
    pub signature: Option<Signature>,
    pub last_loop: Option<LoopEvent>,
    pub caps: Powercap,
    pub started_at: i64,
}

impl ManagedApp {
    pub fn new(pid: u32, job: AppInfo, policy: Policy, freq: u64) -> Self {
        Self {
            pid,
            job,
            policy,
            freq,
            signature: None,
            last_loop: None,
            caps: Powercap::default(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}
