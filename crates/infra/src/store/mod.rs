//! Task storage.
//!
//! `TaskStore` is the only mutable state the runtime shares between threads.
//! Every write is an atomic per-task operation guarded by the record's
//! `version`: a write carrying a stale version fails with
//! [`TaskStoreError::Conflict`], which is how the PENDING→RUNNING lease keeps
//! two workers off the same task.
//!
//! A lease is held until its attempt is written back. Holders renew their
//! leases while attempts run; a lease that has not been renewed for
//! `leaseTimeoutMs` belongs to an owner that is gone and is reclaimed.

mod in_memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use persevere_core::{RetryError, RetryTask, TaskId, TaskStatus};

pub use in_memory::InMemoryTaskStore;

/// Durable CRUD over retry tasks.
pub trait TaskStore: Send + Sync {
    /// Insert a new task.
    fn create(&self, task: RetryTask) -> Result<TaskId, TaskStoreError>;

    /// Fetch a task, live or archived.
    fn get(&self, id: TaskId) -> Result<Option<RetryTask>, TaskStoreError>;

    /// Replace a task if `task.version` matches the stored one.
    ///
    /// Returns the stored record, whose version has been bumped.
    fn update(&self, task: &RetryTask) -> Result<RetryTask, TaskStoreError>;

    /// Lease up to `limit` due tasks, oldest eligible first.
    ///
    /// Returned tasks are already RUNNING; a task leased here is never
    /// returned again until it leaves RUNNING.
    fn find_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryTask>, TaskStoreError>;

    /// Lease one PENDING task regardless of its eligible time.
    ///
    /// `Ok(None)` when the task exists but is not PENDING.
    fn try_lease(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<RetryTask>, TaskStoreError>;

    /// Extend leases that are still held at the given versions to `now`.
    ///
    /// Only RUNNING tasks whose version matches are touched. The version is
    /// left as it is, so the holder's eventual `update` still applies.
    /// Returns the ids that were renewed.
    fn renew_leases(
        &self,
        held: &[(TaskId, u64)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Return RUNNING tasks leased before `older_than` to PENDING.
    fn reclaim_stale_leases(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Move a non-terminal task to CANCELLED. Terminal tasks are returned
    /// unchanged.
    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<RetryTask, TaskStoreError>;

    fn delete(&self, id: TaskId) -> Result<(), TaskStoreError>;

    /// Move a task out of the live set. Archived tasks stay readable via
    /// `get` but are never leased again.
    fn archive(&self, id: TaskId) -> Result<(), TaskStoreError>;

    /// Live tasks, optionally filtered by status, oldest first.
    fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<RetryTask>, TaskStoreError>;

    /// Live and archived tasks carrying `biz_id`.
    fn find_by_biz_id(&self, biz_id: &str) -> Result<Vec<RetryTask>, TaskStoreError>;

    fn stats(&self) -> Result<TaskStats, TaskStoreError>;
}

impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    fn create(&self, task: RetryTask) -> Result<TaskId, TaskStoreError> {
        (**self).create(task)
    }

    fn get(&self, id: TaskId) -> Result<Option<RetryTask>, TaskStoreError> {
        (**self).get(id)
    }

    fn update(&self, task: &RetryTask) -> Result<RetryTask, TaskStoreError> {
        (**self).update(task)
    }

    fn find_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryTask>, TaskStoreError> {
        (**self).find_due_tasks(now, limit)
    }

    fn try_lease(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<RetryTask>, TaskStoreError> {
        (**self).try_lease(id, now)
    }

    fn renew_leases(
        &self,
        held: &[(TaskId, u64)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        (**self).renew_leases(held, now)
    }

    fn reclaim_stale_leases(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        (**self).reclaim_stale_leases(older_than, now)
    }

    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<RetryTask, TaskStoreError> {
        (**self).cancel(id, now)
    }

    fn delete(&self, id: TaskId) -> Result<(), TaskStoreError> {
        (**self).delete(id)
    }

    fn archive(&self, id: TaskId) -> Result<(), TaskStoreError> {
        (**self).archive(id)
    }

    fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<RetryTask>, TaskStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn find_by_biz_id(&self, biz_id: &str) -> Result<Vec<RetryTask>, TaskStoreError> {
        (**self).find_by_biz_id(biz_id)
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        (**self).stats()
    }
}

/// Task store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("task {0} was modified concurrently")]
    Conflict(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl TaskStoreError {
    /// Backend failures are worth retrying; the rest are answers.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskStoreError::Storage(_))
    }
}

impl From<TaskStoreError> for RetryError {
    fn from(err: TaskStoreError) -> Self {
        RetryError::storage(err.to_string())
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    pub archived: usize,
}

impl TaskStats {
    pub(crate) fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Exhausted => self.exhausted += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Live tasks, archived ones excluded.
    pub fn live(&self) -> usize {
        self.pending + self.running + self.succeeded + self.exhausted + self.cancelled
    }
}
