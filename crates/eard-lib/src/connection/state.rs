//! Process-wide daemon state
//!
//! Every piece of state shared between connection threads, the monitor and
//! the policy engine lives in one [`DaemonState`] behind one bounded lock.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::Connection;
use crate::config::{ClusterConf, CoreConfig, NodeConf};
use crate::descriptors::{DescriptorSet, DescriptorSnapshot};
use crate::lock::{BoundedMutex, LockConfig};
use crate::models::{AppStatus, NodeInfo, NodeMetrics};
use crate::policy::{effective_limit, ManagedApp, PowercapDomain, RiskEngine, RiskLevel};

/// Handle shared by every component
pub type SharedState = Arc<BoundedMutex<DaemonState>>;

/// Status report together with its arrival time
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub status: AppStatus,
    pub updated: Instant,
}

#[derive(Debug)]
pub struct DaemonState {
    pub descriptors: DescriptorSet,
    pub connections: HashMap<RawFd, Connection>,
    pub statuses: HashMap<String, StatusEntry>,
    pub apps: BTreeMap<u32, ManagedApp>,
    pub risk: RiskEngine,
    pub node: NodeConf,
    /// Node configuration as loaded, for RESTORE_CONF
    pub node_defaults: NodeConf,
    pub cluster: ClusterConf,
    pub last_metrics: Option<NodeMetrics>,
    /// Frequency ceiling requested by the administrator, in kHz
    pub max_freq: u64,
    /// Last frequency the actuator accepted
    pub applied_freq: Option<u64>,
    /// POWER cap the actuator last accepted, `None` once lifted
    pub applied_power_cap: Option<f64>,
    /// Cap enforced because a powercap request came in below the current draw
    pub throttle_cap: Option<f64>,
}

impl DaemonState {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            descriptors: DescriptorSet::new(),
            connections: HashMap::new(),
            statuses: HashMap::new(),
            apps: BTreeMap::new(),
            risk: RiskEngine::new(config.cluster.risk),
            node: config.node.clone(),
            node_defaults: config.node.clone(),
            cluster: config.cluster.clone(),
            last_metrics: None,
            max_freq: config.node.max_freq(),
            applied_freq: None,
            applied_power_cap: None,
            throttle_cap: None,
        }
    }

    /// Wrap the state in its bounded lock
    pub fn shared(self, lock: LockConfig) -> SharedState {
        Arc::new(BoundedMutex::with_config(self, lock))
    }

    /// Tightest limit of `domain` across running applications and the node budget
    pub fn limit(&self, domain: PowercapDomain) -> Option<f64> {
        let node = match domain {
            PowercapDomain::Energy => self.node.max_energy_j,
            PowercapDomain::Power => self.node.max_power_w,
        };
        effective_limit(
            self.apps
                .values()
                .map(|app| app.caps.get(domain))
                .chain(std::iter::once(node)),
        )
    }

    /// Frequency the node should run at right now
    ///
    /// The highest frequency any running job asks for (or the default
    /// policy's frequency when idle), bounded by the administrator ceiling
    /// and the risk ceiling.
    pub fn target_frequency(&self) -> u64 {
        let wanted = self
            .apps
            .values()
            .map(|app| app.freq)
            .max()
            .unwrap_or_else(|| self.node.policy(self.node.default_policy).freq);

        let ceiling = self
            .risk
            .action(&self.node, self.limit(PowercapDomain::Power))
            .freq_ceiling;

        self.node.snap_freq(wanted.min(self.max_freq).min(ceiling))
    }

    /// Frequency to actuate, if it differs from what was last applied
    pub fn plan_frequency(&self) -> Option<u64> {
        let target = self.target_frequency();
        (self.applied_freq != Some(target)).then_some(target)
    }

    /// POWER cap the hardware should carry right now
    ///
    /// The hard cap while POWER is at panic, otherwise the throttle of a
    /// below-draw powercap request.
    pub fn target_power_cap(&self) -> Option<f64> {
        self.risk
            .action(&self.node, self.limit(PowercapDomain::Power))
            .hard_power_cap
            .or(self.throttle_cap)
    }

    /// Cap change to actuate; `Some(None)` lifts the programmed cap
    pub fn plan_power_cap(&self) -> Option<Option<f64>> {
        let target = self.target_power_cap();
        (self.applied_power_cap != target).then_some(target)
    }

    /// Status of this node as other daemons see it
    pub fn local_status(&self) -> AppStatus {
        let metrics = self.last_metrics.unwrap_or_default();
        let app_info = self
            .apps
            .values()
            .next()
            .map(|app| app.job)
            .unwrap_or_default();

        AppStatus {
            ip: self.node.hostname.clone(),
            ok: true,
            policy_conf: self.node.policy_conf,
            node_info: NodeInfo {
                avg_freq: metrics.frequency,
                temp: metrics.temperature,
                power: metrics.power_w,
                max_freq: self.max_freq,
            },
            app_info,
        }
    }

    pub fn upsert_status(&mut self, status: AppStatus) {
        self.statuses.insert(
            status.ip.clone(),
            StatusEntry {
                status,
                updated: Instant::now(),
            },
        );
    }
}

/// Consistent view of the daemon, for STATUS requests and the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusReport {
    pub hostname: String,
    pub descriptors: DescriptorSnapshot,
    pub apps: Vec<ManagedApp>,
    pub risk: u8,
    pub energy_level: RiskLevel,
    pub power_level: RiskLevel,
    pub max_freq: u64,
    pub target_freq: u64,
    pub applied_freq: Option<u64>,
    pub last_metrics: Option<NodeMetrics>,
}

impl NodeStatusReport {
    pub fn capture(state: &DaemonState) -> Self {
        Self {
            hostname: state.node.hostname.clone(),
            descriptors: state.descriptors.snapshot(),
            apps: state.apps.values().cloned().collect(),
            risk: state.risk.state().bits(),
            energy_level: state.risk.level(PowercapDomain::Energy),
            power_level: state.risk.level(PowercapDomain::Power),
            max_freq: state.max_freq,
            target_freq: state.target_frequency(),
            applied_freq: state.applied_freq,
            last_metrics: state.last_metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppInfo, Policy};
    use crate::policy::Powercap;

    fn app(pid: u32, freq: u64) -> ManagedApp {
        ManagedApp::new(pid, AppInfo { job_id: 1, step_id: 0 }, Policy::MinEnergy, freq)
    }

    #[test]
    fn test_idle_target_is_default_policy_frequency() {
        let state = DaemonState::new(&CoreConfig::default());
        assert_eq!(state.target_frequency(), 2_400_000);
        assert_eq!(state.plan_frequency(), Some(2_400_000));
    }

    #[test]
    fn test_target_bounded_by_ceilings() {
        let mut state = DaemonState::new(&CoreConfig::default());
        state.apps.insert(10, app(10, 2_200_000));
        state.apps.insert(11, app(11, 1_600_000));
        assert_eq!(state.target_frequency(), 2_200_000);

        state.max_freq = 2_000_000;
        assert_eq!(state.target_frequency(), 2_000_000);

        state
            .risk
            .set_risk(RiskLevel::Panic.flags(PowercapDomain::Energy));
        assert_eq!(state.target_frequency(), 1_000_000);

        state.applied_freq = Some(1_000_000);
        assert_eq!(state.plan_frequency(), None);
    }

    #[test]
    fn test_limit_takes_tightest_cap() {
        let mut state = DaemonState::new(&CoreConfig::default());
        assert_eq!(state.limit(PowercapDomain::Power), None);

        state.node.max_power_w = Some(400.0);
        let mut a = app(1, 2_000_000);
        a.caps = Powercap {
            energy_j: None,
            power_w: Some(320.0),
        };
        state.apps.insert(1, a);

        assert_eq!(state.limit(PowercapDomain::Power), Some(320.0));
        assert_eq!(state.limit(PowercapDomain::Energy), None);
    }

    #[test]
    fn test_power_cap_plan_follows_panic_and_throttle() {
        let mut state = DaemonState::new(&CoreConfig::default());
        state.node.max_power_w = Some(300.0);
        assert_eq!(state.plan_power_cap(), None);

        state
            .risk
            .set_risk(RiskLevel::Panic.flags(PowercapDomain::Power));
        assert_eq!(state.plan_power_cap(), Some(Some(300.0)));
        state.applied_power_cap = Some(300.0);
        assert_eq!(state.plan_power_cap(), None);

        // Leaving panic lifts the cap unless a throttle still holds it
        state
            .risk
            .set_risk(RiskLevel::Warning2.flags(PowercapDomain::Power));
        assert_eq!(state.plan_power_cap(), Some(None));
        state.throttle_cap = Some(280.0);
        assert_eq!(state.plan_power_cap(), Some(Some(280.0)));
    }
}
