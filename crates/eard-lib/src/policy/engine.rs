use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::actuator::Actuator;
use super::model::{select_frequency, LinearModel, PerformanceModel, Signature};
use super::powercap::{Powercap, PowercapDomain, PowercapRequest};
use super::risk::{RiskAction, RiskLevel, RiskState, RiskTransition};
use super::ManagedApp;
use crate::checkpoint::{Checkpoint, PowermonApp};
use crate::connection::{DaemonState, NodeStatusReport, SharedState};
use crate::dynais::LoopEvent;
use crate::error::{EardError, Result};
use crate::hooks::HookTable;
use crate::models::{AppInfo, NodeMetrics, Policy};
use crate::observability::{EardMetrics, StructuredLogger};

/// Job start request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub pid: u32,
    pub job_id: u64,
    pub step_id: u64,
    /// Policy to run under, the node default when absent
    #[serde(default)]
    pub policy: Option<Policy>,
}

/// What one metrics sample changed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsOutcome {
    pub transitions: Vec<RiskTransition>,
    pub action: RiskAction,
    /// Frequency actuated because of this sample
    pub frequency: Option<u64>,
}

fn actuation_error(err: EardError) -> EardError {
    match err {
        EardError::ActuationFailure(_) => err,
        other => EardError::actuation(other.to_string()),
    }
}

/// Policy and risk decisions for the node
///
/// Each operation decides under the shared lock and actuates after
/// releasing it. When the actuator fails the decision stays recorded, the
/// applied frequency does not move, and the next evaluation retries.
///
/// Operations that actuate hold the actuation mutex from planning until the
/// outcome is recorded, so `applied_freq` and `applied_power_cap` always
/// describe the last request the hardware received.
pub struct PolicyEngine {
    state: SharedState,
    actuator: Arc<dyn Actuator>,
    actuation: Mutex<()>,
    model: Arc<dyn PerformanceModel>,
    hooks: HookTable,
    metrics: EardMetrics,
    logger: StructuredLogger,
}

impl PolicyEngine {
    pub fn new(state: SharedState, actuator: Arc<dyn Actuator>) -> Self {
        Self {
            state,
            actuator,
            actuation: Mutex::new(()),
            model: Arc::new(LinearModel::default()),
            hooks: HookTable::new(),
            metrics: EardMetrics::new(),
            logger: StructuredLogger::new("eard"),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn PerformanceModel>) -> Self {
        self.model = model;
        self
    }

    pub fn with_hooks(mut self, hooks: HookTable) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    fn apply_frequency(&self, planned: Option<u64>, reason: &str) -> Result<Option<u64>> {
        let Some(freq) = planned else {
            return Ok(None);
        };

        if let Err(e) = self.actuator.set_cpu_frequency(freq) {
            self.metrics.inc_actuation_failures();
            warn!(freq_khz = freq, reason, error = %e, "Frequency request failed");
            return Err(actuation_error(e));
        }

        let previous = self.state.with_lock(|state| {
            let previous = state.applied_freq;
            state.applied_freq = Some(freq);
            Ok(previous)
        })?;

        self.metrics.set_target_frequency(freq);
        self.logger.log_frequency_change(previous, freq, reason);
        Ok(Some(freq))
    }

    /// Held while planning, actuating and recording
    fn serialize(&self) -> MutexGuard<'_, ()> {
        // The guarded unit carries no data, a panicked holder leaves nothing torn
        self.actuation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_power_cap(&self, planned: Option<Option<f64>>) -> Result<()> {
        let Some(cap) = planned else {
            return Ok(());
        };

        let requested = match cap {
            Some(watts) => self.actuator.set_power_limit(PowercapDomain::Power, watts),
            None => self.actuator.clear_power_limit(PowercapDomain::Power),
        };
        if let Err(e) = requested {
            self.metrics.inc_actuation_failures();
            warn!(cap_w = ?cap, error = %e, "Power cap request failed");
            return Err(actuation_error(e));
        }

        self.state.with_lock(|state| {
            state.applied_power_cap = cap;
            Ok(())
        })?;
        match cap {
            Some(watts) => info!(watts, "Power cap programmed"),
            None => info!("Power cap lifted"),
        }
        Ok(())
    }

    fn publish_risk(&self, state: RiskState) {
        for domain in PowercapDomain::ALL {
            self.metrics
                .set_risk_level(domain, RiskLevel::from_mask(state, domain));
        }
    }

    /// Start managing a job
    pub fn new_job(&self, job: NewJob) -> Result<ManagedApp> {
        if job.pid == 0 {
            return Err(EardError::invalid("pid 0 cannot run a job"));
        }

        let serial = self.serialize();
        let (app, planned, count) = self.state.with_lock(|state| {
            if state.apps.contains_key(&job.pid) {
                return Err(EardError::invalid(format!("pid {} already runs a job", job.pid)));
            }

            let policy = job.policy.unwrap_or(state.node.default_policy);
            let freq = state.node.snap_freq(state.node.policy(policy).freq);
            let info = AppInfo {
                job_id: job.job_id,
                step_id: job.step_id,
            };
            let app = ManagedApp::new(job.pid, info, policy, freq);
            state.apps.insert(job.pid, app.clone());

            let status = state.local_status();
            state.upsert_status(status);
            Ok((app, state.plan_frequency(), state.apps.len()))
        })?;
        let applied = self.apply_frequency(planned, "new_job");
        drop(serial);

        self.metrics.set_managed_apps(count);
        self.logger.log_job(app.pid, app.job.job_id, app.job.step_id, true);
        self.hooks.run_new_job(&app);
        applied?;
        Ok(app)
    }

    /// Stop managing a job; risk is forgotten once no job is left
    pub fn end_job(&self, pid: u32) -> Result<ManagedApp> {
        let serial = self.serialize();
        let (app, planned, planned_cap, count, risk) = self.state.with_lock(|state| {
            let app = state
                .apps
                .remove(&pid)
                .ok_or_else(|| EardError::not_found(format!("no job for pid {}", pid)))?;

            if state.apps.is_empty() {
                state.risk.reset();
                state.throttle_cap = None;
            }

            let status = state.local_status();
            state.upsert_status(status);
            Ok((
                app,
                state.plan_frequency(),
                state.plan_power_cap(),
                state.apps.len(),
                state.risk.state(),
            ))
        })?;
        let capped = self.apply_power_cap(planned_cap);
        let applied = self.apply_frequency(planned, "end_job");
        drop(serial);

        self.metrics.set_managed_apps(count);
        self.publish_risk(risk);
        self.logger.log_job(app.pid, app.job.job_id, app.job.step_id, false);
        self.hooks.run_end_job(&app);
        applied?;
        capped?;
        Ok(app)
    }

    /// Re-evaluate the frequency of a job after its detector reported a loop
    ///
    /// Returns the frequency actuated, if any. Signatures within the
    /// configured change threshold of the previous one keep the current
    /// selection.
    pub fn on_loop_event(
        &self,
        pid: u32,
        event: LoopEvent,
        signature: Signature,
    ) -> Result<Option<u64>> {
        let model = self.model.clone();

        let _serial = self.serialize();
        let planned = self.state.with_lock(|state| {
            let threshold = state.cluster.signature_change_threshold;
            let node = &state.node;
            let app = state
                .apps
                .get_mut(&pid)
                .ok_or_else(|| EardError::not_found(format!("no job for pid {}", pid)))?;

            app.last_loop = Some(event);
            let changed = app
                .signature
                .map_or(true, |previous| signature.differs(&previous, threshold));
            if !changed {
                return Ok(None);
            }

            let conf = node.policy(app.policy);
            app.freq = select_frequency(app.policy, conf, &signature, node, model.as_ref());
            app.signature = Some(signature);
            debug!(pid, freq_khz = app.freq, policy = %app.policy, "Phase frequency selected");

            Ok(state.plan_frequency())
        })?;

        self.metrics.inc_loop_events(event.level);
        self.logger.log_loop_detected(pid, &event);
        self.apply_frequency(planned, "loop_event")
    }

    /// Account one metrics sample and react to risk changes
    pub fn on_metrics(&self, metrics: NodeMetrics) -> Result<MetricsOutcome> {
        let _serial = self.serialize();
        let (transitions, action, planned_freq, planned_cap, risk) =
            self.state.with_lock(|state| {
                state.last_metrics = Some(metrics);

                let window = state.cluster.energy_window_secs;
                let energy_j =
                    state
                        .risk
                        .record_energy(metrics.timestamp, metrics.energy_mj, window);
                let power_limit = state.limit(PowercapDomain::Power);
                let energy_limit = state.limit(PowercapDomain::Energy);

                let mut transitions = Vec::new();
                let readings = [
                    (PowercapDomain::Energy, energy_j, energy_limit),
                    (PowercapDomain::Power, metrics.power_w, power_limit),
                ];
                for (domain, value, limit) in readings {
                    // No local limit: the mask stays whatever the global manager set
                    let Some(limit) = limit else {
                        continue;
                    };
                    if let Some(transition) = state.risk.observe(domain, value / limit * 100.0) {
                        transitions.push(transition);
                    }
                }

                let action = state.risk.action(&state.node, power_limit);
                let status = state.local_status();
                state.upsert_status(status);
                Ok((
                    transitions,
                    action,
                    state.plan_frequency(),
                    state.plan_power_cap(),
                    state.risk.state(),
                ))
            })?;

        self.publish_risk(risk);
        for t in &transitions {
            self.logger.log_risk_transition(t.domain, t.from, t.to);
        }

        let capped = self.apply_power_cap(planned_cap);
        let frequency = self.apply_frequency(planned_freq, "risk")?;
        capped?;

        Ok(MetricsOutcome {
            transitions,
            action,
            frequency,
        })
    }

    /// Set the cap of one domain for a running job
    ///
    /// Unknown pids and domains are rejected before anything changes. A
    /// POWER cap below the current draw is enforced immediately; one above
    /// it releases an earlier throttle.
    pub fn set_powercap(&self, request: PowercapRequest) -> Result<()> {
        let (domain, limit) = request.validate()?;

        let _serial = self.serialize();
        let planned = self.state.with_lock(|state| {
            let app = state
                .apps
                .get_mut(&request.pid)
                .ok_or_else(|| EardError::invalid(format!("unknown pid {}", request.pid)))?;
            app.caps.set(domain, limit);

            if domain == PowercapDomain::Power {
                let over = state.last_metrics.map_or(false, |m| m.power_w > limit);
                state.throttle_cap = if over {
                    state.limit(PowercapDomain::Power)
                } else {
                    None
                };
            }
            Ok(state.plan_power_cap())
        })?;

        self.logger.log_powercap_change(request.pid, domain, limit);
        self.apply_power_cap(planned)
    }

    pub fn get_powercap(&self, pid: u32) -> Result<Powercap> {
        self.state.with_lock(|state| {
            state
                .apps
                .get(&pid)
                .map(|app| app.caps)
                .ok_or_else(|| EardError::invalid(format!("unknown pid {}", pid)))
        })
    }

    /// Lower or raise the administrator frequency ceiling
    pub fn set_max_freq(&self, khz: u64) -> Result<Option<u64>> {
        if khz == 0 {
            return Err(EardError::invalid("maximum frequency must be positive"));
        }
        let _serial = self.serialize();
        let planned = self.state.with_lock(|state| {
            state.max_freq = state.node.snap_freq(khz);
            let status = state.local_status();
            state.upsert_status(status);
            Ok(state.plan_frequency())
        })?;
        self.apply_frequency(planned, "max_freq")
    }

    /// Change the threshold of one policy
    pub fn set_policy_th(&self, policy: Policy, th: f64) -> Result<()> {
        if !th.is_finite() || th < 0.0 {
            return Err(EardError::invalid(format!("invalid policy threshold {}", th)));
        }
        self.state.with_lock(|state| {
            state.node.policy_conf[policy.index()].th = th;
            let status = state.local_status();
            state.upsert_status(status);
            Ok(())
        })
    }

    /// Pin every running job (or the idle node) to one frequency
    pub fn set_frequency(&self, khz: u64) -> Result<Option<u64>> {
        if khz == 0 {
            return Err(EardError::invalid("frequency must be positive"));
        }
        let _serial = self.serialize();
        let planned = self.state.with_lock(|state| {
            let freq = state.node.snap_freq(khz);
            if state.apps.is_empty() {
                let idle = state.node.default_policy.index();
                state.node.policy_conf[idle].freq = freq;
            } else {
                state.apps.values_mut().for_each(|app| app.freq = freq);
            }
            Ok(state.plan_frequency())
        })?;
        self.apply_frequency(planned, "set_freq")
    }

    /// Go back to the node configuration loaded at startup
    pub fn restore_conf(&self) -> Result<Option<u64>> {
        let _serial = self.serialize();
        let planned = self.state.with_lock(|state| {
            state.node = state.node_defaults.clone();
            state.max_freq = state.node.max_freq();

            let node = &state.node;
            for app in state.apps.values_mut() {
                app.freq = node.snap_freq(node.policy(app.policy).freq);
                app.signature = None;
            }

            let status = state.local_status();
            state.upsert_status(status);
            Ok(state.plan_frequency())
        })?;
        self.apply_frequency(planned, "restore_conf")
    }

    fn update_risk(&self, f: impl FnOnce(&mut DaemonState)) -> Result<Option<u64>> {
        let _serial = self.serialize();
        let (planned, planned_cap, risk) = self.state.with_lock(|state| {
            f(state);
            Ok((state.plan_frequency(), state.plan_power_cap(), state.risk.state()))
        })?;
        self.publish_risk(risk);

        let capped = self.apply_power_cap(planned_cap);
        let applied = self.apply_frequency(planned, "risk")?;
        capped?;
        Ok(applied)
    }

    /// Replace the risk mask, as the global manager does
    pub fn set_risk(&self, flags: RiskState) -> Result<Option<u64>> {
        self.update_risk(|state| state.risk.set_risk(flags))
    }

    pub fn add_risk(&self, flags: RiskState) -> Result<Option<u64>> {
        self.update_risk(|state| state.risk.add_risk(flags))
    }

    pub fn del_risk(&self, flags: RiskState) -> Result<Option<u64>> {
        self.update_risk(|state| state.risk.del_risk(flags))
    }

    pub fn is_risk_set(&self, flags: RiskState) -> Result<bool> {
        self.state.with_lock(|state| Ok(state.risk.is_risk_set(flags)))
    }

    pub fn risk_state(&self) -> Result<RiskState> {
        self.state.with_lock(|state| Ok(state.risk.state()))
    }

    pub fn status_report(&self) -> Result<NodeStatusReport> {
        self.state
            .with_lock(|state| Ok(NodeStatusReport::capture(state)))
    }

    /// Snapshot of the configuration and job state worth keeping over a restart
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.state.with_lock(|state| {
            Ok(Checkpoint {
                cluster_conf: state.cluster.clone(),
                node_conf: state.node.clone(),
                powermon_app: PowermonApp {
                    apps: state.apps.values().cloned().collect(),
                    risk: state.risk.state().bits(),
                    max_freq: state.max_freq,
                },
            })
        })
    }

    /// Reinstate a checkpoint and re-apply the resulting frequency
    pub fn restore(&self, checkpoint: Checkpoint) -> Result<Option<u64>> {
        checkpoint.node_conf.validate()?;
        checkpoint.cluster_conf.validate()?;

        let _serial = self.serialize();
        let (planned, planned_cap, risk, count) = self.state.with_lock(|state| {
            let Checkpoint {
                cluster_conf,
                node_conf,
                powermon_app,
            } = checkpoint;

            state.risk.set_config(cluster_conf.risk);
            state.risk.set_risk(RiskState::from_raw(powermon_app.risk));
            state.max_freq = if powermon_app.max_freq == 0 {
                node_conf.max_freq()
            } else {
                node_conf.snap_freq(powermon_app.max_freq)
            };
            state.node = node_conf;
            state.cluster = cluster_conf;
            state.apps = powermon_app
                .apps
                .into_iter()
                .map(|app| (app.pid, app))
                .collect();
            state.applied_freq = None;
            state.applied_power_cap = None;
            state.throttle_cap = None;

            let status = state.local_status();
            state.upsert_status(status);
            Ok((
                state.plan_frequency(),
                state.plan_power_cap(),
                state.risk.state(),
                state.apps.len(),
            ))
        })?;

        self.metrics.set_managed_apps(count);
        self.publish_risk(risk);
        let capped = self.apply_power_cap(planned_cap);
        let applied = self.apply_frequency(planned, "restore")?;
        capped?;
        Ok(applied)
    }
}
