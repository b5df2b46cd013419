//! Metrics sampling loop
//!
//! Polls the metrics provider at a fixed interval, hands every fresh sample
//! to the policy engine and reports the outcome to the health registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::MetricsProvider;
use crate::connection::ConnectionManager;
use crate::error::EardError;
use crate::health::{Component, HealthRegistry};
use crate::observability::EardMetrics;
use crate::policy::{MetricsOutcome, PolicyEngine};

/// Configuration for the sampling loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Polling interval (default: 1 second)
    pub interval: Duration,
    /// Node status entries older than this are dropped (default: 5 minutes)
    pub status_max_age: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            status_max_age: Duration::from_secs(300),
        }
    }
}

/// Result of one polling cycle
#[derive(Debug)]
pub enum TickOutcome {
    /// The provider had nothing new
    Idle,
    Applied(MetricsOutcome),
    Failed(String),
}

/// Periodic sampler driving risk evaluation
pub struct MonitorLoop {
    provider: Arc<dyn MetricsProvider>,
    engine: Arc<PolicyEngine>,
    connections: Option<ConnectionManager>,
    health: Option<HealthRegistry>,
    config: MonitorConfig,
    metrics: EardMetrics,
}

impl MonitorLoop {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        engine: Arc<PolicyEngine>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            provider,
            engine,
            connections: None,
            health: None,
            config,
            metrics: EardMetrics::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting metrics sampling loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    cycles += 1;
                    if let TickOutcome::Failed(reason) = &outcome {
                        debug!(cycles, reason = %reason, "Sampling cycle failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!(cycles, "Shutting down metrics sampling loop");
                    break;
                }
            }
        }
    }

    /// One polling cycle
    pub async fn tick(&self) -> TickOutcome {
        let start = Instant::now();

        let sample = match self.provider.sample().await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                self.sweep();
                return TickOutcome::Idle;
            }
            Err(e) => {
                self.metrics.inc_monitor_errors();
                warn!(error = %e, "Metrics provider failed");
                self.mark_degraded(Component::Monitor, format!("provider failed: {}", e))
                    .await;
                return TickOutcome::Failed(e.to_string());
            }
        };

        // Actuation may block on the controller, keep it off the runtime workers
        let engine = self.engine.clone();
        let applied = tokio::task::spawn_blocking(move || engine.on_metrics(sample)).await;

        let outcome = match applied {
            Err(e) => {
                self.metrics.inc_monitor_errors();
                warn!(error = %e, "Metrics sample handler aborted");
                self.mark_degraded(Component::Monitor, format!("handler aborted: {}", e))
                    .await;
                TickOutcome::Failed(e.to_string())
            }
            Ok(Ok(outcome)) => {
                self.mark_healthy(Component::Monitor).await;
                self.mark_healthy(Component::Policy).await;
                TickOutcome::Applied(outcome)
            }
            Ok(Err(e @ EardError::ActuationFailure(_))) => {
                self.mark_healthy(Component::Monitor).await;
                self.mark_degraded(Component::Policy, e.to_string()).await;
                TickOutcome::Failed(e.to_string())
            }
            Ok(Err(e)) => {
                self.metrics.inc_monitor_errors();
                warn!(error = %e, "Metrics sample not applied");
                self.mark_degraded(Component::Monitor, e.to_string()).await;
                TickOutcome::Failed(e.to_string())
            }
        };

        self.metrics
            .observe_monitor_latency(start.elapsed().as_secs_f64());
        self.sweep();
        outcome
    }

    fn sweep(&self) {
        let Some(connections) = &self.connections else {
            return;
        };
        if let Err(e) = connections.sweep_stale(self.config.status_max_age) {
            debug!(error = %e, "Status sweep skipped");
        }
        self.metrics.set_lock_stats(connections.state().stats());
    }

    async fn mark_healthy(&self, component: Component) {
        if let Some(health) = &self.health {
            health.set_healthy(component).await;
        }
    }

    async fn mark_degraded(&self, component: Component, message: String) {
        if let Some(health) = &self.health {
            health.set_degraded(component, message).await;
        }
    }
}

/// Builder for the sampling loop
pub struct MonitorLoopBuilder {
    provider: Option<Arc<dyn MetricsProvider>>,
    engine: Option<Arc<PolicyEngine>>,
    connections: Option<ConnectionManager>,
    health: Option<HealthRegistry>,
    config: MonitorConfig,
}

impl MonitorLoopBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            engine: None,
            connections: None,
            health: None,
            config: MonitorConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn engine(mut self, engine: Arc<PolicyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Connection manager whose stale node statuses get swept
    pub fn connections(mut self, connections: ConnectionManager) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn status_max_age(mut self, max_age: Duration) -> Self {
        self.config.status_max_age = max_age;
        self
    }

    pub fn build(self) -> Result<MonitorLoop> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("Metrics provider is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("Policy engine is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Sampling interval must be positive");
        }

        let mut monitor = MonitorLoop::new(provider, engine, self.config);
        monitor.connections = self.connections;
        monitor.health = self.health;
        Ok(monitor)
    }
}

impl Default for MonitorLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::connection::DaemonState;
    use crate::health::ComponentStatus;
    use crate::lock::LockConfig;
    use crate::models::{AppStatus, NodeMetrics};
    use crate::monitor::ReportedMetrics;
    use crate::policy::{Actuator, DryRunActuator, PowercapDomain};
    use async_trait::async_trait;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct BrokenProvider;

    #[async_trait]
    impl MetricsProvider for BrokenProvider {
        async fn sample(&self) -> anyhow::Result<Option<NodeMetrics>> {
            anyhow::bail!("sensor unreachable")
        }
    }

    /// Holds the engine's actuation slot for a while on every frequency change
    struct SlowActuator {
        entered: Mutex<mpsc::Sender<()>>,
    }

    impl Actuator for SlowActuator {
        fn set_cpu_frequency(&self, _khz: u64) -> crate::Result<()> {
            if let Ok(entered) = self.entered.lock() {
                let _ = entered.send(());
            }
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }

        fn set_power_limit(&self, _domain: PowercapDomain, _watts: f64) -> crate::Result<()> {
            Ok(())
        }

        fn clear_power_limit(&self, _domain: PowercapDomain) -> crate::Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<PolicyEngine>, ConnectionManager) {
        let state = DaemonState::new(&CoreConfig::default()).shared(LockConfig::default());
        let engine = PolicyEngine::new(state.clone(), Arc::new(DryRunActuator::new()));
        (Arc::new(engine), ConnectionManager::new(state))
    }

    fn reading(ts: i64) -> NodeMetrics {
        NodeMetrics {
            timestamp: ts,
            energy_mj: 250_000,
            power_w: 250.0,
            temperature: 61.0,
            frequency: 2_400_000,
        }
    }

    #[test]
    fn test_monitor_config_default() {
        let config = MonitorConfig::default();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.status_max_age, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_builder_requires_provider_and_engine() {
        let (engine, _) = setup();
        assert!(MonitorLoopBuilder::new().engine(engine.clone()).build().is_err());
        assert!(MonitorLoopBuilder::new()
            .provider(Arc::new(ReportedMetrics::new()))
            .build()
            .is_err());
        assert!(MonitorLoopBuilder::new()
            .provider(Arc::new(ReportedMetrics::new()))
            .engine(engine)
            .interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_tick_applies_reported_sample() {
        let (engine, connections) = setup();
        let reported = Arc::new(ReportedMetrics::new());
        let monitor = MonitorLoopBuilder::new()
            .provider(reported.clone())
            .engine(engine.clone())
            .connections(connections)
            .build()
            .unwrap();

        assert!(matches!(monitor.tick().await, TickOutcome::Idle));

        reported.push(reading(10)).unwrap();
        match monitor.tick().await {
            TickOutcome::Applied(outcome) => assert!(outcome.transitions.is_empty()),
            other => panic!("unexpected outcome {:?}", other),
        }

        let report = engine.status_report().unwrap();
        assert_eq!(report.last_metrics, Some(reading(10)));
        assert!(matches!(monitor.tick().await, TickOutcome::Idle));
    }

    #[tokio::test]
    async fn test_tick_waiting_on_actuation_leaves_runtime_free() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let state = DaemonState::new(&CoreConfig::default()).shared(LockConfig::default());
        let engine = Arc::new(PolicyEngine::new(
            state,
            Arc::new(SlowActuator {
                entered: Mutex::new(entered_tx),
            }),
        ));
        let reported = Arc::new(ReportedMetrics::new());
        reported.push(reading(10)).unwrap();
        let monitor = MonitorLoopBuilder::new()
            .provider(reported)
            .engine(engine.clone())
            .build()
            .unwrap();

        let admin = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.set_max_freq(1_000_000))
        };
        entered_rx.recv().unwrap();

        // The tick queues behind the admin change; timers on this runtime keep firing
        let ticking = tokio::spawn(async move { monitor.tick().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ticking.is_finished());

        assert!(matches!(ticking.await.unwrap(), TickOutcome::Applied(_)));
        assert_eq!(admin.join().unwrap().unwrap(), Some(1_000_000));
    }

    #[tokio::test]
    async fn test_provider_failure_marks_monitor_degraded() {
        let (engine, _) = setup();
        let health = HealthRegistry::new();
        health.register(Component::Monitor).await;

        let monitor = MonitorLoopBuilder::new()
            .provider(Arc::new(BrokenProvider))
            .engine(engine)
            .health(health.clone())
            .build()
            .unwrap();

        assert!(matches!(monitor.tick().await, TickOutcome::Failed(_)));
        let status = health.health().await;
        assert_eq!(status.components[&Component::Monitor].status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_stale_statuses_swept() {
        let (engine, connections) = setup();
        connections
            .report_status(AppStatus {
                ip: "10.0.0.8".to_string(),
                ok: true,
                ..Default::default()
            })
            .unwrap();

        let monitor = MonitorLoopBuilder::new()
            .provider(Arc::new(ReportedMetrics::new()))
            .engine(engine)
            .connections(connections.clone())
            .status_max_age(Duration::ZERO)
            .build()
            .unwrap();

        monitor.tick().await;
        assert!(connections.status_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (engine, _) = setup();
        let reported = Arc::new(ReportedMetrics::new());
        reported.push(reading(1)).unwrap();

        let monitor = MonitorLoopBuilder::new()
            .provider(reported)
            .engine(engine.clone())
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(engine.status_report().unwrap().last_metrics.is_some());
    }
}
