//! Operation Lock
//!
//! TigerStyle: At most one lifecycle operation touches the remote at a time.
//!
//! Acquisition never waits: a held lock rejects the caller immediately.
//! Release is tied to [`OperationGuard`]'s `Drop`, so every exit path
//! (success, error, panic unwind) releases exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

// =============================================================================
// Types
// =============================================================================

/// Which lifecycle operation holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Update,
    UpdateDriver,
    Delete,
    Backup,
    BackupAll,
    ScheduledBackup,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::UpdateDriver => "update_driver",
            Self::Delete => "delete",
            Self::Backup => "backup",
            Self::BackupAll => "backup_all",
            Self::ScheduledBackup => "scheduled_backup",
        };
        f.write_str(name)
    }
}

/// Context of the current lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Driver, instance or registry id the operation works on
    pub target: String,
    pub acquired_at: DateTime<Utc>,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} since {}", self.kind, self.target, self.acquired_at.to_rfc3339())
    }
}

/// Process-wide exclusivity lock. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    holder: Arc<Mutex<Option<LockHolder>>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Option<LockHolder>> {
        self.holder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock, or report who holds it.
    pub fn try_acquire(
        &self,
        kind: OperationKind,
        target: impl Into<String>,
    ) -> Result<OperationGuard, LockBusy> {
        let mut state = self.state();
        if let Some(current) = state.as_ref() {
            tracing::info!(requested = %kind, holder = %current, "operation rejected, lock held");
            return Err(LockBusy {
                holder: current.clone(),
            });
        }

        let holder = LockHolder {
            id: Uuid::new_v4(),
            kind,
            target: target.into(),
            acquired_at: Utc::now(),
        };
        tracing::info!(operation = %holder.kind, target = %holder.target, "lock acquired");
        *state = Some(holder.clone());

        Ok(OperationGuard {
            lock: self.clone(),
            holder,
        })
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<LockHolder> {
        self.state().clone()
    }

    fn release(&self, id: Uuid) {
        let mut state = self.state();
        match state.as_ref() {
            Some(current) if current.id == id => {
                tracing::info!(operation = %current.kind, target = %current.target, "lock released");
                *state = None;
            }
            // Only the guard that acquired the lock can clear it
            _ => tracing::error!(guard = %id, "release by a guard that does not hold the lock"),
        }
    }
}

/// Proof of holding the [`OperationLock`]. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct OperationGuard {
    lock: OperationLock,
    holder: LockHolder,
}

impl OperationGuard {
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Release now instead of at scope end.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.lock.release(self.holder.id);
    }
}

// =============================================================================
// Errors
// =============================================================================

/// The lock is held by another operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("another operation is in progress: {holder}")]
pub struct LockBusy {
    pub holder: LockHolder,
}

// =============================================================================
// Tests
// =============================================================================
