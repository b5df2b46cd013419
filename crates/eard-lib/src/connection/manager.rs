use std::os::unix::io::RawFd;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::{Connection, Registration, SharedState};
use crate::descriptors::DescriptorSnapshot;
use crate::error::{EardError, Result};
use crate::models::AppStatus;
use crate::observability::EardMetrics;

/// Attaches and detaches clients and keeps the node status table
///
/// Cloning is cheap; every clone operates on the same shared state.
/// Descriptors are never closed here: whoever owns the socket closes it.
#[derive(Clone)]
pub struct ConnectionManager {
    state: SharedState,
    metrics: EardMetrics,
}

impl ConnectionManager {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            metrics: EardMetrics::new(),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Register a freshly accepted descriptor
    pub fn attach(&self, fd: RawFd, registration: Registration) -> Result<()> {
        let total = self.state.with_lock(|state| {
            state.descriptors.register(fd)?;
            state.connections.insert(
                fd,
                Connection {
                    fd,
                    registration,
                    attached_at: Utc::now(),
                },
            );
            Ok(state.descriptors.total())
        })?;

        self.metrics.set_active_connections(total);
        debug!(fd, total, "Descriptor attached");
        Ok(())
    }

    /// Forget a descriptor, returning what was registered for it
    pub fn detach(&self, fd: RawFd) -> Result<Connection> {
        let (connection, total) = self.state.with_lock(|state| {
            state.descriptors.deregister(fd)?;
            let connection = state
                .connections
                .remove(&fd)
                .ok_or_else(|| EardError::not_found(format!("connection {} not registered", fd)))?;
            Ok((connection, state.descriptors.total()))
        })?;

        self.metrics.set_active_connections(total);
        debug!(fd, total, "Descriptor detached");
        Ok(connection)
    }

    pub fn contains(&self, fd: RawFd) -> Result<bool> {
        self.state.with_lock(|state| Ok(state.descriptors.contains(fd)))
    }

    /// Drop every registration, returning how many there were
    pub fn clear(&self) -> Result<usize> {
        let dropped = self.state.with_lock(|state| {
            let dropped = state.descriptors.total();
            state.descriptors.clear();
            state.connections.clear();
            Ok(dropped)
        })?;

        self.metrics.set_active_connections(0);
        Ok(dropped)
    }

    /// Consistent copy of the descriptor set, for a multiplexed wait
    pub fn snapshot(&self) -> Result<DescriptorSnapshot> {
        self.state.with_lock(|state| Ok(state.descriptors.snapshot()))
    }

    pub fn connections(&self) -> Result<Vec<Connection>> {
        self.state.with_lock(|state| {
            let mut all: Vec<Connection> = state.connections.values().cloned().collect();
            all.sort_by_key(|c| c.fd);
            Ok(all)
        })
    }

    /// Record the latest status of a node
    pub fn report_status(&self, status: AppStatus) -> Result<()> {
        if status.ip.is_empty() {
            return Err(EardError::invalid("status report without node address"));
        }
        self.state.with_lock(|state| {
            state.upsert_status(status);
            Ok(())
        })
    }

    pub fn status(&self, ip: &str) -> Result<AppStatus> {
        self.state.with_lock(|state| {
            state
                .statuses
                .get(ip)
                .map(|entry| entry.status.clone())
                .ok_or_else(|| EardError::not_found(format!("no status for {}", ip)))
        })
    }

    /// Every known node status, ordered by address
    pub fn status_all(&self) -> Result<Vec<AppStatus>> {
        self.state.with_lock(|state| {
            let mut all: Vec<AppStatus> =
                state.statuses.values().map(|e| e.status.clone()).collect();
            all.sort_by(|a, b| a.ip.cmp(&b.ip));
            Ok(all)
        })
    }

    /// Remove status entries not refreshed within `max_age`
    pub fn sweep_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        let removed = self.state.with_lock(|state| {
            let stale: Vec<String> = state
                .statuses
                .iter()
                .filter(|(_, entry)| entry.updated.elapsed() >= max_age)
                .map(|(ip, _)| ip.clone())
                .collect();
            for ip in &stale {
                state.statuses.remove(ip);
            }
            Ok(stale)
        })?;

        if !removed.is_empty() {
            debug!(count = removed.len(), "Swept stale node status entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::connection::DaemonState;
    use crate::descriptors::NO_DESCRIPTOR;
    use crate::lock::LockConfig;
    use std::sync::Arc;
    use std::thread;

    fn manager() -> ConnectionManager {
        let state = DaemonState::new(&CoreConfig::default()).shared(LockConfig::default());
        ConnectionManager::new(state)
    }

    fn status(ip: &str) -> AppStatus {
        AppStatus {
            ip: ip.to_string(),
            ok: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_attach_detach() {
        let manager = manager();
        manager.attach(7, Registration::new("local")).unwrap();
        manager.attach(4, Registration::new("local").with_pid(42)).unwrap();

        let snap = manager.snapshot().unwrap();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.max, 7);
        assert!(manager.contains(4).unwrap());

        let conn = manager.detach(4).unwrap();
        assert_eq!(conn.registration.pid, Some(42));
        assert!(!manager.contains(4).unwrap());
        assert_eq!(manager.connections().unwrap().len(), 1);
    }

    #[test]
    fn test_attach_twice_rejected_without_change() {
        let manager = manager();
        manager.attach(5, Registration::new("a")).unwrap();

        let err = manager.attach(5, Registration::new("b")).unwrap_err();
        assert!(matches!(err, EardError::InvalidArgument(_)));

        let conns = manager.connections().unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].registration.peer, "a");
    }

    #[test]
    fn test_detach_unknown_is_not_found() {
        let manager = manager();
        assert!(matches!(manager.detach(3), Err(EardError::NotFound(_))));
    }

    #[test]
    fn test_clear() {
        let manager = manager();
        manager.attach(3, Registration::new("a")).unwrap();
        manager.attach(9, Registration::new("b")).unwrap();

        assert_eq!(manager.clear().unwrap(), 2);
        let snap = manager.snapshot().unwrap();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.max, NO_DESCRIPTOR);
        assert!(manager.connections().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_attach_detach_keeps_counts() {
        let manager = Arc::new(manager());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let fd = t * 100 + i;
                        manager.attach(fd, Registration::new("worker")).unwrap();
                        if i % 2 == 0 {
                            manager.detach(fd).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = manager.snapshot().unwrap();
        assert_eq!(snap.total, 8 * 25);
        assert_eq!(snap.max, 749);
        assert_eq!(manager.connections().unwrap().len(), snap.total);
    }

    #[test]
    fn test_status_table() {
        let manager = manager();
        manager.report_status(status("10.0.0.2")).unwrap();
        manager.report_status(status("10.0.0.1")).unwrap();

        let mut updated = status("10.0.0.2");
        updated.ok = false;
        manager.report_status(updated).unwrap();

        let all = manager.status_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].ip, "10.0.0.1");
        assert!(!manager.status("10.0.0.2").unwrap().ok);
        assert!(matches!(manager.status("10.0.0.9"), Err(EardError::NotFound(_))));

        assert!(manager.report_status(status("")).is_err());
    }

    #[test]
    fn test_sweep_stale() {
        let manager = manager();
        manager.report_status(status("10.0.0.1")).unwrap();

        assert!(manager.sweep_stale(Duration::from_secs(3600)).unwrap().is_empty());
        let removed = manager.sweep_stale(Duration::ZERO).unwrap();
        assert_eq!(removed, vec!["10.0.0.1".to_string()]);
        assert!(manager.status_all().unwrap().is_empty());
    }
}
