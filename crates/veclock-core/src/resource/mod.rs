//! Per-resource reader/writer locks.
//!
//! Lock structures are created on first use, shared through a global table
//! plus per-node caches, and reclaimed once unreferenced and the table holds
//! more idle locks than configured.
//!
//! # Waiting
//!
//! | Mode  | Lock-free phase         | After the retry ceiling                  |
//! |-------|-------------------------|------------------------------------------|
//! | Read  | CAS on the state word   | `Busy`                                   |
//! | Write | CAS free -> writer-held | announced, parked in bounded wait slices |
//!
//! An announced writer turns new readers away (`Busy`), so a steady stream
//! of readers cannot starve it.

mod handle;
mod lock;
mod manager;


pub use handle::{ResourceGuard, ResourceLockHandle};
pub use lock::{ResourceLock, ResourceLockInfo, ResourceLockStats};
pub use manager::{LockManager, ManagerStats};

use serde::{Deserialize, Serialize};

/// Access mode of a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Shared access; any number of concurrent holders.
    Read,
    /// Exclusive access.
    Write,
}

impl LockMode {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}
