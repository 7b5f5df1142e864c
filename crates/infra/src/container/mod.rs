//! Retry container: the scheduling loop.
//!
//! The container owns the background side of the engine. A dedicated
//! scheduler thread wakes every `tickIntervalMs` and runs one tick:
//!
//! 1. **Renew** every lease this container holds, so long-running attempts
//!    keep their tasks.
//! 2. **Reclaim** RUNNING tasks whose lease has not been renewed for
//!    `leaseTimeoutMs`. Their owner crashed or lost contact with the store,
//!    and the tasks go back to PENDING.
//! 3. **Lease** up to `min(batchSize, free workers)` due tasks and queue them
//!    on the worker pool.
//!
//! ## Ownership
//!
//! A task is held from the moment it is queued (or attempted inline by
//! [`RetryContainer::run_due_once`]) until its attempt returns. Held leases
//! are renewed before any reclaim, so a target that blocks past
//! `leaseTimeoutMs` is never handed to a second worker. Renewal keeps the
//! task's version, so the holder's write still applies; a reclaim bumps it,
//! so a late write from an owner that really was gone fails and is reported
//! as `Skipped(LeaseLost)`.
//!
//! ## Failure handling
//!
//! Slow storage only ever delays the scheduler thread; slow targets only
//! ever occupy workers. A failed store call ends the tick early, is counted
//! in `tick_failures` and feeds the shared storage health signal. The next
//! tick simply tries again, and no task is failed because of storage.
//!
//! ## Shutdown
//!
//! [`ContainerHandle::stop`] ends ticking, lets running attempts finish and
//! releases anything still queued back to PENDING.

mod leases;
mod pool;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use persevere_core::{RetryError, RetryTask, TaskId};

use crate::executor::{AttemptReport, RetryExecutor};

use leases::HeldLeases;
use pool::WorkerPool;

/// Counters kept by the container.
#[derive(Debug, Default)]
pub struct ContainerStats {
    ticks: AtomicU64,
    tick_failures: AtomicU64,
    reclaimed: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
    vetoed: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`ContainerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub tick_failures: u64,
    pub reclaimed: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub vetoed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub in_flight: usize,
}

impl ContainerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            ticks: get(&self.ticks),
            tick_failures: get(&self.tick_failures),
            reclaimed: get(&self.reclaimed),
            dispatched: get(&self.dispatched),
            succeeded: get(&self.succeeded),
            retried: get(&self.retried),
            exhausted: get(&self.exhausted),
            vetoed: get(&self.vetoed),
            skipped: get(&self.skipped),
            errors: get(&self.errors),
            in_flight: 0,
        }
    }

    pub(crate) fn record(&self, result: &Result<AttemptReport, RetryError>) {
        let counter = match result {
            Ok(AttemptReport::Succeeded) => &self.succeeded,
            Ok(AttemptReport::Retrying { .. }) => &self.retried,
            Ok(AttemptReport::Exhausted { .. }) => &self.exhausted,
            Ok(AttemptReport::Vetoed(_)) => &self.vetoed,
            Ok(AttemptReport::Skipped(_)) => &self.skipped,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What one synchronous tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub reclaimed: usize,
    pub leased: usize,
    pub outcomes: Vec<(TaskId, Result<AttemptReport, RetryError>)>,
}

/// Lifecycle-managed scheduler around a [`RetryExecutor`].
///
/// Clones share stats and held leases, so inline ticks from several threads
/// and a started background loop all see one another's attempts.
#[derive(Clone)]
pub struct RetryContainer {
    executor: Arc<RetryExecutor>,
    stats: Arc<ContainerStats>,
    held: Arc<HeldLeases>,
}

impl RetryContainer {
    pub fn new(executor: Arc<RetryExecutor>) -> Self {
        Self {
            executor,
            stats: Arc::new(ContainerStats::default()),
            held: Arc::new(HeldLeases::default()),
        }
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one tick on the calling thread, attempting every leased task
    /// inline.
    pub fn run_due_once(&self, now: DateTime<Utc>) -> Result<TickReport, RetryError> {
        let batch = self.executor.config().settings().batch_size;
        self.renew(now)?;
        let reclaimed = self.reclaim(now)?;
        let tasks = self.lease_due(now, batch)?;

        let mut report = TickReport {
            reclaimed,
            leased: tasks.len(),
            outcomes: Vec::with_capacity(tasks.len()),
        };
        // Held until each attempt returns, including the ones still waiting
        // their turn in this batch.
        let guards: Vec<_> = tasks.iter().map(|t| self.held.guard(t)).collect();
        for (task, _guard) in tasks.into_iter().zip(guards) {
            let id = task.id;
            let result = self.executor.attempt(task);
            self.stats.record(&result);
            report.outcomes.push((id, result));
        }
        Ok(report)
    }

    /// Spawn the worker pool and the scheduler thread.
    pub fn start(&self) -> io::Result<ContainerHandle> {
        let settings = self.executor.config().settings();
        let workers = settings.worker_count;
        let interval = settings.tick_interval();

        let pool = Arc::new(WorkerPool::spawn(
            workers,
            self.executor.clone(),
            self.stats.clone(),
            self.held.clone(),
        )?);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let container = self.clone();
        let tick_pool = pool.clone();
        let spawned = thread::Builder::new()
            .name("persevere-scheduler".to_string())
            .spawn(move || {
                info!(
                    workers,
                    tick_interval_ms = interval.as_millis() as u64,
                    "retry container started"
                );
                loop {
                    container.tick(&tick_pool, Utc::now());
                    match shutdown_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("retry container scheduler stopped");
            });

        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                pool.shutdown();
                return Err(err);
            }
        };

        Ok(ContainerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            pool,
            container: self.clone(),
        })
    }

    fn tick(&self, pool: &WorkerPool, now: DateTime<Utc>) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        if self.renew(now).is_err() || self.reclaim(now).is_err() {
            return;
        }

        let capacity = pool.free_capacity();
        if capacity == 0 {
            debug!("all workers busy; skipping lease");
            return;
        }
        let limit = capacity.min(self.executor.config().settings().batch_size);

        let Ok(tasks) = self.lease_due(now, limit) else {
            return;
        };
        for task in tasks {
            self.dispatch(pool, task);
        }
    }

    fn dispatch(&self, pool: &WorkerPool, task: RetryTask) -> bool {
        match pool.dispatch(task) {
            Ok(()) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(task) => {
                debug!(task_id = %task.id, "worker pool closed; releasing lease");
                if let Err(err) = self.executor.release_lease(&task) {
                    warn!(task_id = %task.id, error = %err, "failed to release lease");
                }
                false
            }
        }
    }

    /// Extend every lease this container still holds.
    fn renew(&self, now: DateTime<Utc>) -> Result<(), RetryError> {
        let held = self.held.snapshot();
        if held.is_empty() {
            return Ok(());
        }
        let store = self.executor.config().store();
        match store.renew_leases(&held, now) {
            Ok(renewed) => {
                debug!(held = held.len(), renewed = renewed.len(), "renewed held leases");
                Ok(())
            }
            Err(err) => Err(self.tick_failed("renew_leases", err.into())),
        }
    }

    fn reclaim(&self, now: DateTime<Utc>) -> Result<usize, RetryError> {
        let timeout = self.executor.config().settings().lease_timeout();
        let older_than = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let store = self.executor.config().store();
        match store.reclaim_stale_leases(older_than, now) {
            Ok(ids) => {
                if !ids.is_empty() {
                    warn!(count = ids.len(), tasks = ?ids, "reclaimed stale leases");
                    self.stats.reclaimed.fetch_add(ids.len() as u64, Ordering::Relaxed);
                }
                Ok(ids.len())
            }
            Err(err) => Err(self.tick_failed("reclaim_stale_leases", err.into())),
        }
    }

    fn lease_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryTask>, RetryError> {
        let store = self.executor.config().store();
        match store.find_due_tasks(now, limit) {
            Ok(tasks) => {
                self.executor.health().record_success();
                if !tasks.is_empty() {
                    debug!(count = tasks.len(), "leased due retry tasks");
                }
                Ok(tasks)
            }
            Err(err) => Err(self.tick_failed("find_due_tasks", err.into())),
        }
    }

    fn tick_failed(&self, operation: &str, err: RetryError) -> RetryError {
        self.stats.tick_failures.fetch_add(1, Ordering::Relaxed);
        self.executor.health().record_failure(operation, &err.to_string());
        err
    }
}

/// Handle to control a running container.
pub struct ContainerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    pool: Arc<WorkerPool>,
    container: RetryContainer,
}

impl ContainerHandle {
    /// Stop ticking, wait for running attempts and release queued ones.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.pool.shutdown();
        info!("retry container stopped");
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        self.container.executor()
    }

    /// Lease `id` now, regardless of its eligible time, and queue it.
    ///
    /// Returns `false` when the task is not PENDING or the pool is closed.
    pub fn submit(&self, id: TaskId) -> Result<bool, RetryError> {
        let store = self.container.executor.config().store();
        match store.try_lease(id, Utc::now())? {
            Some(task) => Ok(self.container.dispatch(&self.pool, task)),
            None => Ok(false),
        }
    }

    /// Cancel a task.
    ///
    /// A queued task is skipped when its worker picks it up. An attempt
    /// already inside the target runs to completion, but its write loses the
    /// version race, so the task stays CANCELLED and no further event is
    /// published for it.
    pub fn cancel(&self, id: TaskId) -> Result<RetryTask, RetryError> {
        let store = self.container.executor.config().store();
        let task = store.cancel(id, Utc::now())?;
        info!(task_id = %id, status = %task.status, "retry task cancel requested");
        Ok(task)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_flight: self.pool.in_flight(),
            ..self.container.stats()
        }
    }

    /// Storage health as seen by the executor and scheduler.
    pub fn is_healthy(&self) -> bool {
        self.container.executor.health().is_healthy()
    }
}

impl core::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("running", &self.join.is_some())
            .field("in_flight", &self.pool.in_flight())
            .finish()
    }
}
