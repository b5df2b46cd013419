//! Descriptor bookkeeping for connected clients
//!
//! Tracks which descriptors the daemon is currently serving, together with
//! the `max`/`total` pair a multiplexed wait needs. The set never closes a
//! descriptor; closing belongs to whoever owns the connection.

use std::collections::BTreeSet;
use std::os::unix::io::RawFd;

use serde::Serialize;

use crate::error::{EardError, Result};

/// Value of `max` when no descriptor is tracked
pub const NO_DESCRIPTOR: RawFd = -1;

/// Set of registered descriptors with its derived `max` and `total`
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    fds: BTreeSet<RawFd>,
    max: RawFd,
    total: usize,
}

/// Consistent copy of a descriptor set taken under the shared lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorSnapshot {
    pub fds: Vec<RawFd>,
    pub max: RawFd,
    pub total: usize,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self {
            fds: BTreeSet::new(),
            max: NO_DESCRIPTOR,
            total: 0,
        }
    }

    /// Track a new descriptor
    ///
    /// Fails with `InvalidArgument` for negative or already tracked
    /// descriptors, leaving the set unchanged.
    pub fn register(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(EardError::invalid(format!("descriptor {} is negative", fd)));
        }
        if !self.fds.insert(fd) {
            return Err(EardError::invalid(format!("descriptor {} already registered", fd)));
        }

        self.total += 1;
        if fd > self.max {
            self.max = fd;
        }
        Ok(())
    }

    /// Stop tracking a descriptor
    ///
    /// `max` is recomputed from the remaining descriptors.
    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        if !self.fds.remove(&fd) {
            return Err(EardError::not_found(format!("descriptor {} not registered", fd)));
        }

        self.total -= 1;
        self.max = self.fds.iter().next_back().copied().unwrap_or(NO_DESCRIPTOR);
        Ok(())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn clear(&mut self) {
        self.fds.clear();
        self.max = NO_DESCRIPTOR;
        self.total = 0;
    }

    pub fn max(&self) -> RawFd {
        self.max
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fds.iter().copied()
    }

    pub fn snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            fds: self.fds.iter().copied().collect(),
            max: self.max,
            total: self.total,
        }
    }
}

impl Default for DescriptorSet {
    fn default() -> Self {
        Self::new()
    }
}
