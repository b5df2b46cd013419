//! Observability infrastructure for the node daemon
//!
//! Provides:
//! - Prometheus metrics (lock contention, connections, requests, loop events, risk, frequency)
//! - Structured JSON logging of control-plane events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::dynais::LoopEvent;
use crate::lock::LockStats;
use crate::policy::{PowercapDomain, RiskLevel};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EardMetricsInner> = OnceLock::new();

struct EardMetricsInner {
    lock_acquisitions: IntGauge,
    lock_contended_attempts: IntGauge,
    lock_failures: IntGauge,
    active_connections: IntGauge,
    requests: IntCounterVec,
    request_errors: IntCounterVec,
    loop_events: IntCounterVec,
    risk_level: IntGaugeVec,
    target_frequency_khz: IntGauge,
    managed_apps: IntGauge,
    actuation_failures: IntCounter,
    monitor_latency_seconds: Histogram,
    monitor_errors: IntCounter,
}

impl EardMetricsInner {
    fn new() -> Self {
        Self {
            lock_acquisitions: register_int_gauge!(
                "eard_lock_acquisitions",
                "Successful acquisitions of the shared state lock"
            )
            .expect("Failed to register lock_acquisitions"),

            lock_contended_attempts: register_int_gauge!(
                "eard_lock_contended_attempts",
                "Acquisition attempts that found the shared state lock busy"
            )
            .expect("Failed to register lock_contended_attempts"),

            lock_failures: register_int_gauge!(
                "eard_lock_failures",
                "Acquisitions that exhausted their retry budget or hit a poisoned lock"
            )
            .expect("Failed to register lock_failures"),

            active_connections: register_int_gauge!(
                "eard_active_connections",
                "Client descriptors currently registered"
            )
            .expect("Failed to register active_connections"),

            requests: register_int_counter_vec!(
                "eard_requests_total",
                "Requests received by option code",
                &["code"]
            )
            .expect("Failed to register requests"),

            request_errors: register_int_counter_vec!(
                "eard_request_errors_total",
                "Failed requests by error kind",
                &["kind"]
            )
            .expect("Failed to register request_errors"),

            loop_events: register_int_counter_vec!(
                "eard_loop_events_total",
                "Loop events reported by applications, by nesting level",
                &["level"]
            )
            .expect("Failed to register loop_events"),

            risk_level: register_int_gauge_vec!(
                "eard_risk_level",
                "Current risk level per domain (0 none, 1 warning1, 2 warning2, 3 panic)",
                &["domain"]
            )
            .expect("Failed to register risk_level"),

            target_frequency_khz: register_int_gauge!(
                "eard_target_frequency_khz",
                "Last CPU frequency accepted by the actuator"
            )
            .expect("Failed to register target_frequency_khz"),

            managed_apps: register_int_gauge!(
                "eard_managed_apps",
                "Applications currently managed on this node"
            )
            .expect("Failed to register managed_apps"),

            actuation_failures: register_int_counter!(
                "eard_actuation_failures_total",
                "Frequency or power requests rejected by the controller"
            )
            .expect("Failed to register actuation_failures"),

            monitor_latency_seconds: register_histogram!(
                "eard_monitor_latency_seconds",
                "Time spent sampling metrics and re-evaluating risk",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register monitor_latency_seconds"),

            monitor_errors: register_int_counter!(
                "eard_monitor_errors_total",
                "Failed monitor cycles"
            )
            .expect("Failed to register monitor_errors"),
        }
    }
}

/// Daemon metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone, Debug)]
pub struct EardMetrics {
    _private: (),
}

impl Default for EardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EardMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EardMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EardMetricsInner {
        GLOBAL_METRICS.get_or_init(EardMetricsInner::new)
    }

    /// Publish the counters of the shared state lock
    pub fn set_lock_stats(&self, stats: LockStats) {
        let inner = self.inner();
        inner.lock_acquisitions.set(stats.acquisitions as i64);
        inner.lock_contended_attempts.set(stats.contended_attempts as i64);
        inner.lock_failures.set(stats.failures as i64);
    }

    pub fn set_active_connections(&self, count: usize) {
        self.inner().active_connections.set(count as i64);
    }

    pub fn inc_requests(&self, code: u32) {
        let code = code.to_string();
        self.inner().requests.with_label_values(&[code.as_str()]).inc();
    }

    pub fn inc_request_errors(&self, kind: &str) {
        self.inner().request_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_loop_events(&self, level: usize) {
        let level = level.to_string();
        self.inner().loop_events.with_label_values(&[level.as_str()]).inc();
    }

    pub fn set_risk_level(&self, domain: PowercapDomain, level: RiskLevel) {
        self.inner()
            .risk_level
            .with_label_values(&[domain.as_str()])
            .set(level.as_i64());
    }

    pub fn set_target_frequency(&self, khz: u64) {
        self.inner().target_frequency_khz.set(khz as i64);
    }

    pub fn set_managed_apps(&self, count: usize) {
        self.inner().managed_apps.set(count as i64);
    }

    pub fn inc_actuation_failures(&self) {
        self.inner().actuation_failures.inc();
    }

    pub fn observe_monitor_latency(&self, duration_secs: f64) {
        self.inner().monitor_latency_seconds.observe(duration_secs);
    }

    pub fn inc_monitor_errors(&self) {
        self.inner().monitor_errors.inc();
    }
}

/// Structured logger for control-plane events
///
/// Every event carries the node name and an `event` field so log pipelines
/// can filter on it.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str, socket: &str) {
        info!(
            event = "daemon_started",
            node = %self.node_name,
            version = %version,
            socket = %socket,
            "Node daemon started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Node daemon shutting down"
        );
    }

    pub fn log_connection(&self, fd: i32, peer: &str, attached: bool) {
        if attached {
            info!(
                event = "connection_attached",
                node = %self.node_name,
                fd = fd,
                peer = %peer,
                "Client connected"
            );
        } else {
            info!(
                event = "connection_detached",
                node = %self.node_name,
                fd = fd,
                peer = %peer,
                "Client disconnected"
            );
        }
    }

    pub fn log_job(&self, pid: u32, job_id: u64, step_id: u64, started: bool) {
        let event = if started { "job_started" } else { "job_ended" };
        info!(
            event = event,
            node = %self.node_name,
            pid = pid,
            job_id = job_id,
            step_id = step_id,
            "Job lifecycle change"
        );
    }

    /// Log a loop reported by an application
    pub fn log_loop_detected(&self, pid: u32, event: &LoopEvent) {
        info!(
            event = "loop_detected",
            node = %self.node_name,
            pid = pid,
            size = event.size,
            level = event.level,
            detected_at = event.detected_at,
            "Application phase detected"
        );
    }

    pub fn log_frequency_change(&self, old_khz: Option<u64>, new_khz: u64, reason: &str) {
        info!(
            event = "frequency_changed",
            node = %self.node_name,
            old_khz = ?old_khz,
            new_khz = new_khz,
            reason = %reason,
            "CPU frequency changed"
        );
    }

    pub fn log_powercap_change(&self, pid: u32, domain: PowercapDomain, limit: f64) {
        info!(
            event = "powercap_changed",
            node = %self.node_name,
            pid = pid,
            domain = %domain,
            limit = limit,
            "Powercap updated"
        );
    }

    /// Log a confirmed risk level change
    pub fn log_risk_transition(&self, domain: PowercapDomain, from: RiskLevel, to: RiskLevel) {
        if to > from {
            warn!(
                event = "risk_escalated",
                node = %self.node_name,
                domain = %domain,
                from = %from,
                to = %to,
                "Risk level escalated"
            );
        } else {
            info!(
                event = "risk_deescalated",
                node = %self.node_name,
                domain = %domain,
                from = %from,
                to = %to,
                "Risk level de-escalated"
            );
        }
    }

    pub fn log_checkpoint(&self, path: &str, saved: bool, success: bool) {
        let action = if saved { "save" } else { "restore" };
        if success {
            info!(
                event = "checkpoint",
                node = %self.node_name,
                action = action,
                path = %path,
                "Checkpoint {} complete",
                action
            );
        } else {
            warn!(
                event = "checkpoint_failed",
                node = %self.node_name,
                action = action,
                path = %path,
                "Checkpoint {} failed",
                action
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eard_metrics_creation() {
        let metrics = EardMetrics::new();

        metrics.set_lock_stats(LockStats {
            acquisitions: 4,
            contended_attempts: 10,
            failures: 1,
        });
        metrics.set_active_connections(3);
        metrics.inc_requests(500);
        metrics.inc_request_errors("not_found");
        metrics.inc_loop_events(0);
        metrics.set_risk_level(PowercapDomain::Power, RiskLevel::Warning2);
        metrics.set_target_frequency(2_000_000);
        metrics.observe_monitor_latency(0.002);

        let families = prometheus::gather();
        assert!(families.iter().any(|f| f.get_name() == "eard_risk_level"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name(), "test-node");
    }
}
