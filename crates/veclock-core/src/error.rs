//! Error types for the locking core.
//!
//! Every fallible operation returns [`Result`]. Nothing in this crate panics
//! on contention or on a detected cycle: refusals, retry exhaustion and
//! cancellation are ordinary control flow for the caller.

use thiserror::Error;

use crate::config::ConfigError;
use crate::deadlock::LockKey;

/// Locking core error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Inserting the dependency edge `from -> to` would close a cycle.
    ///
    /// The caller must back off and retry with a different acquisition order,
    /// or abort the compound operation.
    #[error("Acquiring {to} while holding {from} would deadlock")]
    WouldDeadlock {
        /// Lock already held by the requesting context.
        from: LockKey,
        /// Lock being requested.
        to: LockKey,
    },

    /// Lock unavailable and blocking was disallowed, or the lock-free retry
    /// ceiling was exceeded.
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Blocking acquisition cancelled by the caller's cancellation signal.
    #[error("Acquisition interrupted: {0}")]
    Interrupted(String),

    /// Allocation failure for a lock, dependency node or edge.
    ///
    /// Existing state is never corrupted; the caller may retry after
    /// backpressure.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// A blocked acquisition was chosen as the victim when the background
    /// resolver broke a dependency cycle.
    #[error("Acquisition of lock {resource_id} aborted to break a deadlock cycle")]
    DeadlockVictim {
        /// Resource (or index) the victim was waiting for.
        resource_id: u64,
    },

    /// A handle was released to a manager that did not issue it.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Configuration rejected by validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Core management structures could not be initialized.
    #[error("Initialization failed: {0}")]
    Init(String),
}

impl Error {
    /// Returns true if the caller can recover by retrying the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WouldDeadlock { .. }
                | Self::Busy(_)
                | Self::OutOfMemory(_)
                | Self::DeadlockVictim { .. }
        )
    }

    /// Returns a short, stable label for the error kind.
    ///
    /// Used as a metric label and in CLI reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WouldDeadlock { .. } => "would_deadlock",
            Self::Busy(_) => "busy",
            Self::Interrupted(_) => "interrupted",
            Self::OutOfMemory(_) => "out_of_memory",
            Self::DeadlockVictim { .. } => "deadlock_victim",
            Self::InvalidHandle(_) => "invalid_handle",
            Self::Config(_) => "config",
            Self::Init(_) => "init",
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory(err.to_string())
    }
}

/// Result type alias for locking core operations.
pub type Result<T> = std::result::Result<T, Error>;
