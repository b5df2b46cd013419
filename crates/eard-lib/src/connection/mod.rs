//! Connection bookkeeping and shared node status
//!
//! The [`ConnectionManager`] tracks which client descriptors are attached and
//! the status reported for every monitored node. All of it lives in the
//! shared [`DaemonState`] and is only touched under its bounded lock.

mod manager;
mod state;

pub use manager::ConnectionManager;
pub use state::{DaemonState, NodeStatusReport, SharedState, StatusEntry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

/// What a client told us about itself when it attached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Peer description, e.g. the socket path or remote address
    pub peer: String,
    /// Process id of a local client, when known
    pub pid: Option<u32>,
}

impl Registration {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// An attached client
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub fd: RawFd,
    pub registration: Registration,
    pub attached_at: DateTime<Utc>,
}
