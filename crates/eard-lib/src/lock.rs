//! Bounded-retry mutual exclusion
//!
//! All shared daemon state sits behind a [`BoundedMutex`]. Acquisition never
//! blocks forever: `trylock` retries a non-blocking acquire up to a fixed
//! attempt budget and then gives up with `ResourceExhausted`, leaving the
//! protected value untouched. Only genuine contention consumes the budget; a
//! poisoned lock fails on the spot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EardError, Result};

/// Default number of contended attempts before `trylock` gives up
pub const DEFAULT_LOCK_ATTEMPTS: u64 = 1_000_000;

/// Yield the thread every this many contended attempts
const YIELD_EVERY: u64 = 1024;

/// Lock configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    /// Contended attempts allowed per acquisition
    #[serde(default = "default_attempts")]
    pub max_attempts: u64,
}

fn default_attempts() -> u64 {
    DEFAULT_LOCK_ATTEMPTS
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_LOCK_ATTEMPTS,
        }
    }
}

/// Counters describing how a lock has been behaving
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub contended_attempts: u64,
    pub failures: u64,
}

/// Mutex with a bounded acquisition budget
pub struct BoundedMutex<T> {
    inner: Mutex<T>,
    max_attempts: u64,
    acquisitions: AtomicU64,
    contended: AtomicU64,
    failures: AtomicU64,
}

impl<T> BoundedMutex<T> {
    /// Create a lock with the default attempt budget
    pub fn new(value: T) -> Self {
        Self::with_config(value, LockConfig::default())
    }

    /// Create a lock with an explicit attempt budget
    pub fn with_config(value: T, config: LockConfig) -> Self {
        Self {
            inner: Mutex::new(value),
            max_attempts: config.max_attempts.max(1),
            acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Attempt budget of this lock
    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    /// Acquire the lock, retrying while it is busy
    ///
    /// The returned guard releases the lock when dropped.
    ///
    /// # Errors
    /// * `ResourceExhausted` when the lock stayed busy for the whole budget
    /// * `LockPoisoned` when a previous holder panicked
    pub fn trylock(&self) -> Result<MutexGuard<'_, T>> {
        let mut attempts = 0u64;

        loop {
            match self.inner.try_lock() {
                Ok(guard) => {
                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    return Ok(guard);
                }
                Err(TryLockError::WouldBlock) => {
                    attempts += 1;
                    self.contended.fetch_add(1, Ordering::Relaxed);

                    if attempts >= self.max_attempts {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(attempts, "Bounded lock budget exhausted");
                        return Err(EardError::ResourceExhausted { attempts });
                    }

                    if attempts % YIELD_EVERY == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Err(TryLockError::Poisoned(_)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(EardError::LockPoisoned);
                }
            }
        }
    }

    /// Run `f` with the lock held
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.trylock()?;
        f(&mut guard)
    }

    /// Snapshot of the lock counters
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended_attempts: self.contended.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl<T: Default> Default for BoundedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for BoundedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedMutex")
            .field("max_attempts", &self.max_attempts)
            .field("stats", &self.stats())
            .finish()
    }
}
