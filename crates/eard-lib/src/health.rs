//! Component health of the node daemon
//!
//! The connection server, the sampling loop, the policy engine and the
//! checkpoint store report here; `/healthz` and `/readyz` read it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Parts of the daemon that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Unix socket request server
    Server,
    /// Metrics sampling loop
    Monitor,
    /// Frequency and powercap actuation
    Policy,
    /// State carried across restarts
    Checkpoint,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Server,
        Component::Monitor,
        Component::Policy,
        Component::Checkpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Server => "server",
            Component::Monitor => "monitor",
            Component::Policy => "policy",
            Component::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst, so the node reports its worst component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving requests, but a sample or an actuation failed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix timestamp of the last report
    pub updated_at: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Board {
    components: BTreeMap<Component, ComponentHealth>,
    serving: bool,
}

/// Shared health board, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    board: Arc<RwLock<Board>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `component` as healthy
    pub async fn register(&self, component: Component) {
        self.report(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn register_all(&self) {
        for component in Component::ALL {
            self.register(component).await;
        }
    }

    pub async fn set_healthy(&self, component: Component) {
        self.report(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn report(
        &self,
        component: Component,
        status: ComponentStatus,
        message: Option<String>,
    ) {
        self.board
            .write()
            .await
            .components
            .insert(component, ComponentHealth::new(status, message));
    }

    /// Whether the socket is accepting requests
    pub async fn set_ready(&self, serving: bool) {
        self.board.write().await.serving = serving;
    }

    pub async fn health(&self) -> HealthResponse {
        let board = self.board.read().await;
        let status = board
            .components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: board.components.clone(),
        }
    }

    /// Ready once serving, as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let board = self.board.read().await;
        if !board.serving {
            return ReadinessResponse {
                ready: false,
                reason: Some("Daemon not yet serving".to_string()),
            };
        }

        let failed: Vec<&str> = board
            .components
            .iter()
            .filter(|(_, health)| health.status == ComponentStatus::Unhealthy)
            .map(|(component, _)| component.as_str())
            .collect();
        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", failed.join(", "))),
            }
        }
    }
}
