use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use persevere_core::{RetryTask, TaskId};

/// Leases held by this container's attempts, with the version each lease was
/// taken at.
///
/// A task is held from the moment it is queued or attempted inline until its
/// attempt returns. Every tick renews what is held before reclaiming stale
/// leases, so an attempt that outlives `leaseTimeoutMs` is never handed to a
/// second worker.
#[derive(Debug, Default)]
pub(crate) struct HeldLeases {
    held: Mutex<HashMap<TaskId, u64>>,
}

impl HeldLeases {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, u64>> {
        // Each entry is written whole, so a poisoned map is still consistent.
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn hold(&self, task: &RetryTask) {
        self.lock().insert(task.id, task.version);
    }

    /// Drop a lease, unless `id` has since been held at another version.
    pub(crate) fn release(&self, id: TaskId, version: u64) {
        let mut held = self.lock();
        if held.get(&id) == Some(&version) {
            held.remove(&id);
        }
    }

    /// Hold `task` until the returned guard is dropped.
    pub(crate) fn guard(&self, task: &RetryTask) -> HoldGuard<'_> {
        self.hold(task);
        HoldGuard {
            leases: self,
            id: task.id,
            version: task.version,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<(TaskId, u64)> {
        self.lock().iter().map(|(id, v)| (*id, *v)).collect()
    }
}

pub(crate) struct HoldGuard<'a> {
    leases: &'a HeldLeases,
    id: TaskId,
    version: u64,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.leases.release(self.id, self.version);
    }
}
