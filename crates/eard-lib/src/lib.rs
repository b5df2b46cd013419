//! Node daemon core for energy-aware runtime control
//!
//! This crate provides:
//! - Loop/phase signature detection over application sample streams
//! - Connection bookkeeping and node status sharing
//! - Frequency policies, powercaps and risk escalation
//! - The request protocol and its Unix socket server
//! - Periodic metrics sampling, checkpointing, health and observability

pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod descriptors;
pub mod dynais;
pub mod error;
pub mod health;
pub mod hooks;
pub mod lock;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod policy;
pub mod protocol;
pub mod server;

pub use checkpoint::{Checkpoint, CheckpointStore, PowermonApp};
pub use config::{ClusterConf, CoreConfig, NodeConf, RiskConfig};
pub use connection::{ConnectionManager, DaemonState, NodeStatusReport, Registration, SharedState};
pub use dynais::{DetectorConfig, LoopEvent, LoopStatus, SignatureDetector};
pub use error::{EardError, ErrorKind, Result};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use hooks::{HookTable, JobHook};
pub use lock::{BoundedMutex, LockConfig};
pub use models::*;
pub use monitor::{MetricsProvider, MonitorLoop, MonitorLoopBuilder, ReportedMetrics};
pub use observability::{EardMetrics, StructuredLogger};
pub use policy::{Actuator, DryRunActuator, PolicyEngine};
pub use server::{ConnectionServer, Dispatcher, ServerHandle};
