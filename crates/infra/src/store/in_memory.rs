use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use persevere_core::{RetryTask, TaskId, TaskStatus};

use super::{TaskStats, TaskStore, TaskStoreError};

type TaskMap = HashMap<TaskId, RetryTask>;

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<TaskMap>,
    archived: RwLock<TaskMap>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(map: &RwLock<TaskMap>) -> Result<RwLockReadGuard<'_, TaskMap>, TaskStoreError> {
        map.read()
            .map_err(|_| TaskStoreError::Storage("task map lock poisoned".to_string()))
    }

    fn write(map: &RwLock<TaskMap>) -> Result<RwLockWriteGuard<'_, TaskMap>, TaskStoreError> {
        map.write()
            .map_err(|_| TaskStoreError::Storage("task map lock poisoned".to_string()))
    }
}

fn bump(task: &mut RetryTask) {
    task.version += 1;
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, mut task: RetryTask) -> Result<TaskId, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        if tasks.contains_key(&task.id) || Self::read(&self.archived)?.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        task.version = 0;
        tasks.insert(id, task);
        Ok(id)
    }

    fn get(&self, id: TaskId) -> Result<Option<RetryTask>, TaskStoreError> {
        if let Some(task) = Self::read(&self.tasks)?.get(&id) {
            return Ok(Some(task.clone()));
        }
        Ok(Self::read(&self.archived)?.get(&id).cloned())
    }

    fn update(&self, task: &RetryTask) -> Result<RetryTask, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        let stored = tasks
            .get_mut(&task.id)
            .ok_or(TaskStoreError::NotFound(task.id))?;
        if stored.version != task.version {
            return Err(TaskStoreError::Conflict(task.id));
        }
        *stored = task.clone();
        bump(stored);
        Ok(stored.clone())
    }

    fn find_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryTask>, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;

        let mut due: Vec<_> = tasks
            .values()
            .filter(|t| t.is_due(now))
            .map(|t| (t.next_eligible_at, t.created_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(task) = tasks.get_mut(&id) {
                task.lease(now);
                bump(task);
                leased.push(task.clone());
            }
        }
        Ok(leased)
    }

    fn try_lease(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<RetryTask>, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        let task = tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        task.lease(now);
        bump(task);
        Ok(Some(task.clone()))
    }

    fn renew_leases(
        &self,
        held: &[(TaskId, u64)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        let mut renewed = Vec::with_capacity(held.len());
        for (id, version) in held {
            let Some(task) = tasks.get_mut(id) else {
                continue;
            };
            if task.status == TaskStatus::Running && task.version == *version {
                task.renew_lease(now);
                renewed.push(*id);
            }
        }
        Ok(renewed)
    }

    fn reclaim_stale_leases(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        let mut reclaimed = Vec::new();
        for task in tasks.values_mut() {
            let stale = task.status == TaskStatus::Running
                && task.leased_at.is_some_and(|at| at < older_than);
            if stale {
                task.release(now);
                bump(task);
                reclaimed.push(task.id);
            }
        }
        Ok(reclaimed)
    }

    fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<RetryTask, TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        match tasks.get_mut(&id) {
            Some(task) => {
                if !task.status.is_terminal() {
                    task.mark_cancelled(now);
                    bump(task);
                }
                Ok(task.clone())
            }
            None => Self::read(&self.archived)?
                .get(&id)
                .cloned()
                .ok_or(TaskStoreError::NotFound(id)),
        }
    }

    fn delete(&self, id: TaskId) -> Result<(), TaskStoreError> {
        let live = Self::write(&self.tasks)?.remove(&id);
        let archived = Self::write(&self.archived)?.remove(&id);
        match live.or(archived) {
            Some(_) => Ok(()),
            None => Err(TaskStoreError::NotFound(id)),
        }
    }

    fn archive(&self, id: TaskId) -> Result<(), TaskStoreError> {
        let mut tasks = Self::write(&self.tasks)?;
        let mut archived = Self::write(&self.archived)?;
        let task = tasks.remove(&id).ok_or(TaskStoreError::NotFound(id))?;
        archived.insert(id, task);
        Ok(())
    }

    fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<RetryTask>, TaskStoreError> {
        let tasks = Self::read(&self.tasks)?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|t| t.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn find_by_biz_id(&self, biz_id: &str) -> Result<Vec<RetryTask>, TaskStoreError> {
        let tasks = Self::read(&self.tasks)?;
        let archived = Self::read(&self.archived)?;
        let mut result: Vec<_> = tasks
            .values()
            .chain(archived.values())
            .filter(|t| t.biz_id.as_deref() == Some(biz_id))
            .cloned()
            .collect();

        result.sort_by_key(|t| t.created_at);
        Ok(result)
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let tasks = Self::read(&self.tasks)?;
        let mut stats = TaskStats {
            archived: Self::read(&self.archived)?.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            stats.count(task.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use persevere_core::EncodedBlob;

    use super::*;

    fn task_at(at: DateTime<Utc>) -> RetryTask {
        RetryTask::new(
            "billing",
            "charge(str, int)",
            EncodedBlob::new("inv", vec![]),
            EncodedBlob::new("pred", vec![]),
            at,
        )
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn create_and_get() {
        let store = InMemoryTaskStore::new();
        let task = task_at(Utc::now());
        let id = store.create(task.clone()).unwrap();

        let fetched = store.get(id).unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert!(matches!(
            store.create(task),
            Err(TaskStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn update_is_optimistic() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store.create(task_at(now)).unwrap();

        let original = store.get(id).unwrap().unwrap();
        let mut first = original.clone();
        first.last_error = Some("first".into());
        let stored = store.update(&first).unwrap();
        assert_eq!(stored.version, original.version + 1);

        // A second writer holding the old version loses.
        let mut second = original;
        second.last_error = Some("second".into());
        assert_eq!(store.update(&second), Err(TaskStoreError::Conflict(id)));
        assert_eq!(
            store.get(id).unwrap().unwrap().last_error.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn find_due_leases_oldest_first_and_only_once() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let late = store.create(task_at(now - secs(10))).unwrap();
        let early = {
            let mut t = task_at(now - secs(5));
            t.next_eligible_at = now - secs(60);
            store.create(t).unwrap()
        };
        let future = {
            let mut t = task_at(now);
            t.next_eligible_at = now + secs(60);
            store.create(t).unwrap()
        };

        let leased = store.find_due_tasks(now, 10).unwrap();
        let ids: Vec<_> = leased.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![early, late]);
        assert!(leased.iter().all(|t| t.status == TaskStatus::Running));

        // Leased tasks are not handed out again.
        assert!(store.find_due_tasks(now, 10).unwrap().is_empty());
        assert_eq!(
            store.get(future).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn find_due_respects_limit() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            store.create(task_at(now - secs(1))).unwrap();
        }
        assert_eq!(store.find_due_tasks(now, 2).unwrap().len(), 2);
        assert_eq!(store.find_due_tasks(now, 10).unwrap().len(), 3);
    }

    #[test]
    fn lease_holder_loses_after_cancel() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store.create(task_at(now)).unwrap();
        let mut leased = store.try_lease(id, now).unwrap().unwrap();

        let cancelled = store.cancel(id, now).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        leased.record_success(now);
        assert_eq!(store.update(&leased), Err(TaskStoreError::Conflict(id)));
        assert!(store.try_lease(id, now).unwrap().is_none());
    }

    #[test]
    fn stale_leases_are_reclaimed() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store.create(task_at(now - secs(120))).unwrap();
        let leased = store.find_due_tasks(now - secs(100), 1).unwrap();
        assert_eq!(leased.len(), 1);

        assert!(store.reclaim_stale_leases(now - secs(200), now).unwrap().is_empty());
        assert_eq!(store.reclaim_stale_leases(now - secs(50), now).unwrap(), vec![id]);

        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.version > leased[0].version);
    }

    #[test]
    fn renewed_lease_is_not_reclaimed() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store.create(task_at(now - secs(120))).unwrap();
        let other = store.create(task_at(now - secs(110))).unwrap();
        let leased = store.find_due_tasks(now - secs(100), 2).unwrap();
        assert_eq!(leased.len(), 2);
        let mine = leased.iter().find(|t| t.id == id).unwrap().clone();

        // A stale version renews nothing.
        assert!(store.renew_leases(&[(id, mine.version + 1)], now).unwrap().is_empty());
        assert_eq!(store.renew_leases(&[(id, mine.version)], now).unwrap(), vec![id]);

        assert_eq!(store.reclaim_stale_leases(now - secs(50), now).unwrap(), vec![other]);
        let held = store.get(id).unwrap().unwrap();
        assert_eq!(held.status, TaskStatus::Running);
        assert_eq!(held.version, mine.version);
        assert_eq!(held.leased_at, Some(now));

        // The holder's write still lands.
        let mut done = mine;
        done.record_success(now);
        assert!(store.update(&done).is_ok());
        assert!(store.renew_leases(&[(id, done.version + 1)], now).unwrap().is_empty());
    }

    #[test]
    fn archive_hides_from_scheduling_but_not_lookup() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let id = store
            .create(task_at(now - secs(1)).with_biz_id(Some("order-7".into())))
            .unwrap();
        store.archive(id).unwrap();

        assert!(store.find_due_tasks(now, 10).unwrap().is_empty());
        assert!(store.get(id).unwrap().is_some());
        assert_eq!(store.find_by_biz_id("order-7").unwrap().len(), 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.live(), 0);

        store.delete(id).unwrap();
        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.delete(id), Err(TaskStoreError::NotFound(id)));
    }

    #[test]
    fn list_and_stats_by_status() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store.create(task_at(now)).unwrap();
        }
        let id = store.create(task_at(now)).unwrap();
        store.cancel(id, now).unwrap();

        assert_eq!(store.list_by_status(Some(TaskStatus::Pending), 10).unwrap().len(), 3);
        assert_eq!(store.list_by_status(None, 2).unwrap().len(), 2);

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.cancelled, 1);
    }
}
