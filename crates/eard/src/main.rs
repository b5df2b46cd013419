//! eard - node daemon for energy-aware runtime control
//!
//! Runs on every compute node: accepts application and admin requests on a
//! Unix socket, tracks jobs and their loop signatures, and drives CPU
//! frequency and powercaps from the sampled node power and energy.

use eard_lib::{
    checkpoint::CheckpointStore,
    connection::{ConnectionManager, DaemonState},
    health::{Component, HealthRegistry},
    hooks::{HookTable, JobHook},
    monitor::{MonitorLoopBuilder, ReportedMetrics},
    observability::{EardMetrics, StructuredLogger},
    policy::{DryRunActuator, ManagedApp, PolicyEngine},
    server::{ConnectionServer, Dispatcher},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EARD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs per-job accounting when a job ends
struct JobAccounting;

impl JobHook for JobAccounting {
    fn name(&self) -> &str {
        "accounting"
    }

    fn on_new_job(&self, app: &ManagedApp) -> eard_lib::Result<()> {
        info!(
            job_id = app.job.job_id,
            step_id = app.job.step_id,
            policy = %app.policy,
            "Job accounting opened"
        );
        Ok(())
    }

    fn on_end_job(&self, app: &ManagedApp) -> eard_lib::Result<()> {
        let runtime_secs = chrono::Utc::now().timestamp() - app.started_at;
        info!(
            job_id = app.job.job_id,
            step_id = app.job.step_id,
            runtime_secs,
            last_freq_khz = app.freq,
            "Job accounting closed"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting eard");

    let config = config::EardConfig::load()?;
    let logger = StructuredLogger::new(config.core.node.hostname.clone());
    logger.log_startup(EARD_VERSION, &config.socket_path.display().to_string());

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = EardMetrics::new();

    let state = DaemonState::new(&config.core).shared(config.core.lock);

    let mut hooks = HookTable::new();
    hooks.register(Arc::new(JobAccounting));

    let engine = Arc::new(
        PolicyEngine::new(state.clone(), Arc::new(DryRunActuator::new()))
            .with_hooks(hooks)
            .with_logger(logger.clone()),
    );

    // Resume from the previous run's checkpoint
    let store = CheckpointStore::new(&config.checkpoint_path);
    let checkpoint_path = config.checkpoint_path.display().to_string();
    if store.exists() {
        match store.load() {
            Ok(checkpoint) => match engine.restore(checkpoint) {
                Ok(_) => {
                    logger.log_checkpoint(&checkpoint_path, false, true);
                    if let Err(e) = store.remove() {
                        warn!(error = %e, "Failed to remove restored checkpoint");
                    }
                }
                Err(e) => {
                    logger.log_checkpoint(&checkpoint_path, false, false);
                    health_registry
                        .set_degraded(Component::Policy, format!("restore failed: {}", e))
                        .await;
                }
            },
            Err(e) => {
                logger.log_checkpoint(&checkpoint_path, false, false);
                health_registry
                    .set_degraded(Component::Checkpoint, format!("unreadable checkpoint: {}", e))
                    .await;
            }
        }
    }

    let connections = ConnectionManager::new(state);
    let reported = Arc::new(ReportedMetrics::new());
    let dispatcher = Arc::new(Dispatcher::new(
        connections.clone(),
        engine.clone(),
        reported.clone(),
    ));
    let server = ConnectionServer::bind(&config.socket_path, dispatcher)
        .context("Failed to bind request socket")?
        .with_logger(logger.clone())
        .start()
        .context("Failed to start connection server")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let monitor = MonitorLoopBuilder::new()
        .provider(reported)
        .engine(engine.clone())
        .connections(connections)
        .health(health_registry.clone())
        .interval(config.monitor_interval())
        .status_max_age(config.status_max_age())
        .build()?;
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        engine.clone(),
        metrics,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_addr.clone(), app_state));

    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    health_registry
        .set_unhealthy(Component::Server, "shutting down")
        .await;

    let _ = shutdown_tx.send(());
    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "Metrics sampling loop ended abnormally");
    }

    match tokio::task::spawn_blocking(move || server.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Connection server shutdown failed"),
        Err(e) => warn!(error = %e, "Connection server shutdown panicked"),
    }

    let saved = engine.checkpoint().and_then(|checkpoint| store.save(&checkpoint));
    if let Err(e) = &saved {
        warn!(error = %e, "Failed to save checkpoint");
    }
    logger.log_checkpoint(&checkpoint_path, true, saved.is_ok());

    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
