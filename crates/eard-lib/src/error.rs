//! Error types for the node daemon core
//!
//! Every fallible core operation returns [`EardError`]. Precondition failures
//! (`InvalidArgument`, `NotFound`, `ResourceExhausted`) are raised before any
//! shared state is touched, so callers can treat them as "nothing changed".

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the core
pub type Result<T> = std::result::Result<T, EardError>;

/// Errors produced by the daemon core
#[derive(Debug, Error)]
pub enum EardError {
    /// The bounded lock could not be acquired within its attempt budget.
    #[error("lock not acquired after {attempts} attempts")]
    ResourceExhausted {
        /// Number of contended attempts made before giving up.
        attempts: u64,
    },

    /// A lock was poisoned by a panicking holder.
    #[error("lock poisoned")]
    LockPoisoned,

    /// Unknown pid, domain or descriptor, or a malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on an unregistered connection or job.
    #[error("not found: {0}")]
    NotFound(String),

    /// The frequency or power controller rejected a request.
    #[error("actuation failed: {0}")]
    ActuationFailure(String),

    /// Descriptor read/write error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload or checkpoint could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error classification, used for wire replies and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceExhausted,
    InvalidArgument,
    NotFound,
    ActuationFailure,
    IoFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ActuationFailure => "actuation_failure",
            ErrorKind::IoFailure => "io_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EardError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EardError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EardError::NotFound(msg.into())
    }

    pub fn actuation(msg: impl Into<String>) -> Self {
        EardError::ActuationFailure(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EardError::ResourceExhausted { .. } | EardError::LockPoisoned => {
                ErrorKind::ResourceExhausted
            }
            EardError::InvalidArgument(_) | EardError::Serialization(_) => {
                ErrorKind::InvalidArgument
            }
            EardError::NotFound(_) => ErrorKind::NotFound,
            EardError::ActuationFailure(_) => ErrorKind::ActuationFailure,
            EardError::Io(_) => ErrorKind::IoFailure,
        }
    }

    /// Whether the connection that produced this error must be dropped
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, EardError::Io(_))
    }
}
