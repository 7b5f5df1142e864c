//! Retry executor.
//!
//! Drives one attempt through INVOKE → {accepted, rejected, fatal} and moves
//! the persisted task accordingly. There are two entry points:
//!
//! - [`RetryExecutor::execute`] runs the caller's original attempt. The call
//!   is encoded first, so arguments that cannot be persisted fail before the
//!   target runs. An accepted or vetoed outcome returns straight to the
//!   caller and leaves nothing behind; a rejected one is stored as a new
//!   task before `execute` returns.
//! - [`RetryExecutor::attempt`] replays a task the container leased. The
//!   lease is checked again, the stored call is decoded and resolved, and
//!   the outcome becomes one of:
//!
//! | outcome | task afterwards | event |
//! |---------|-----------------|-------|
//! | accepted | SUCCEEDED, then archived or deleted | `ATTEMPT_SUCCEEDED` |
//! | rejected, stop strategy quiet | PENDING at the next wait | `ATTEMPT_RETRYING` |
//! | rejected, stop strategy fired | EXHAUSTED | `TASK_EXHAUSTED` |
//! | decode or resolution failure | EXHAUSTED, terminal, attempt not counted | `TASK_EXHAUSTED` |
//! | vetoed by a filter | PENDING, deferred, attempt not counted | none |
//! | cancelled or lease lost | untouched | none |
//!
//! `ATTEMPT_STARTED` is published by the terminal link of the filter chain,
//! right before the target runs, so it only ever announces real calls.
//!
//! ## Ordering
//!
//! State is always written to the store before the matching event is
//! published, so a listener never observes a transition that could still be
//! lost. Every write carries the version the task was leased at; losing that
//! race (the task was cancelled, reclaimed or edited meanwhile) discards the
//! result and reports [`AttemptReport::Skipped`].
//!
//! ## Storage
//!
//! Store calls are retried with exponential backoff (`storageRetryAttempts`
//! starting at `storageRetryBaseMs`) and every failure feeds
//! [`StorageHealth`]. A replay whose storage stays down returns an error and
//! leaves its lease to be reclaimed; the task is never failed because of
//! storage.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use persevere_core::{
    CallOutcome, Invocation, ResultPredicate, RetryError, RetryTarget, RetryTask, StrategyOverride,
    TaskId, TaskStatus, Verdict, invoke_guarded, resolve_target,
};
use persevere_events::{RetryEvent, RetryEventKind};

use crate::config::{CleanupPolicy, RetryConfiguration};
use crate::filter::{AttemptContext, FilterOutcome, FilterRegistry, Veto};
use crate::health::StorageHealth;
use crate::store::TaskStoreError;

/// Per-call options for the original attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub predicate: ResultPredicate,
    pub biz_id: Option<String>,
    pub strategy: StrategyOverride,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate(mut self, predicate: ResultPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_biz_id(mut self, biz_id: impl Into<String>) -> Self {
        self.biz_id = Some(biz_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyOverride) -> Self {
        self.strategy = strategy;
        self
    }
}

/// What the original caller gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum FirstAttempt {
    /// The predicate accepted the outcome; no task was created.
    Completed(CallOutcome),
    /// A filter vetoed the call; the target was not invoked and no task was
    /// created.
    Vetoed(Veto),
    /// The outcome was rejected and a retry is scheduled.
    Scheduled {
        task_id: TaskId,
        next_eligible_at: DateTime<Utc>,
        error: RetryError,
    },
    /// The outcome was rejected and the stop strategy allowed no retries.
    Exhausted { task_id: TaskId, error: RetryError },
}

impl FirstAttempt {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            FirstAttempt::Scheduled { task_id, .. } | FirstAttempt::Exhausted { task_id, .. } => {
                Some(*task_id)
            }
            _ => None,
        }
    }
}

/// Why a leased task was not attempted, or why its result was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cancelled,
    /// Someone else now owns the task (reclaimed, re-leased, or edited).
    LeaseLost,
    NotFound,
}

/// Outcome of one replayed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptReport {
    Succeeded,
    Retrying { next_eligible_at: DateTime<Utc> },
    /// `fatal` is set when the task could not be replayed at all.
    Exhausted { fatal: bool },
    /// A filter vetoed the attempt; the task was deferred without counting
    /// an attempt.
    Vetoed(Veto),
    Skipped(SkipReason),
}

enum Persisted {
    Stored(RetryTask),
    Lost(SkipReason),
}

type Prepared = (Invocation, ResultPredicate, Arc<dyn RetryTarget>);

/// Runs attempts and owns every task state transition.
pub struct RetryExecutor {
    config: Arc<RetryConfiguration>,
    filters: Arc<FilterRegistry>,
    health: Arc<StorageHealth>,
}

impl RetryExecutor {
    pub fn new(config: Arc<RetryConfiguration>, filters: Arc<FilterRegistry>) -> Self {
        let health = Arc::new(StorageHealth::new(
            config.settings().storage_failure_threshold,
        ));
        Self {
            config,
            filters,
            health,
        }
    }

    pub fn config(&self) -> &Arc<RetryConfiguration> {
        &self.config
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    pub fn health(&self) -> &Arc<StorageHealth> {
        &self.health
    }

    /// Run the caller's original attempt.
    ///
    /// The invocation and predicate are encoded before the target runs, so an
    /// unpersistable call fails here without side effects. When the outcome
    /// is rejected the task is stored before this returns; the caller is not
    /// told about later attempts.
    pub fn execute(
        &self,
        invocation: &Invocation,
        options: RetryOptions,
    ) -> Result<FirstAttempt, RetryError> {
        let predicates = self.config.predicates();
        options.predicate.validate(predicates)?;

        let serializers = self.config.serializers();
        let invocation_blob = serializers.invocation.encode(invocation)?;
        let predicate_blob = serializers.predicate.encode(&options.predicate)?;
        let target = resolve_target(self.config.resolver(), invocation.target(), invocation.method())?;

        let ctx = AttemptContext {
            invocation,
            task_id: None,
            biz_id: options.biz_id.as_deref(),
            attempt: 1,
        };
        let outcome = match self.filters.execute(&ctx, &|| {
            invoke_guarded(target.as_ref(), invocation.method(), invocation.args())
        }) {
            FilterOutcome::Completed(outcome) => outcome,
            FilterOutcome::Vetoed(veto) => {
                debug!(invocation = %invocation, veto = %veto, "original attempt vetoed");
                return Ok(FirstAttempt::Vetoed(veto));
            }
        };

        if options.predicate.evaluate(&outcome, predicates)? == Verdict::Accept {
            return Ok(FirstAttempt::Completed(outcome));
        }

        let now = Utc::now();
        let failure = rejection(&outcome);
        let mut task = RetryTask::new(
            invocation.target(),
            invocation.method().to_string(),
            invocation_blob,
            predicate_blob,
            now,
        )
        .with_biz_id(options.biz_id)
        .with_strategy(options.strategy);

        let strategies = self.config.strategies();
        if strategies.should_stop(&task.strategy, 1, task.elapsed(now)) {
            task.record_failure_and_exhaust(failure.to_string(), now);
            let task_id = self.create(&task)?;
            warn!(task_id = %task_id, error = %failure, "retry task exhausted on first attempt");
            self.publish(self.event(RetryEventKind::TaskExhausted, &task).with_error(task.last_error.clone()));
            return Ok(FirstAttempt::Exhausted {
                task_id,
                error: failure,
            });
        }

        let delay = strategies.compute_delay(&task.strategy, 1, now);
        task.record_failure_and_schedule(failure.to_string(), after(now, delay), now);
        let task_id = self.create(&task)?;
        info!(
            task_id = %task_id,
            invocation = %invocation,
            next_eligible_at = %task.next_eligible_at,
            error = %failure,
            "retry task scheduled"
        );
        self.publish(
            self.event(RetryEventKind::AttemptScheduled, &task)
                .with_next_eligible_at(task.next_eligible_at)
                .with_error(task.last_error.clone()),
        );

        Ok(FirstAttempt::Scheduled {
            task_id,
            next_eligible_at: task.next_eligible_at,
            error: failure,
        })
    }

    /// Replay a task leased from the store.
    ///
    /// The lease is re-checked first: a task cancelled or re-leased since it
    /// was handed out is skipped without invoking the target.
    pub fn attempt(&self, leased: RetryTask) -> Result<AttemptReport, RetryError> {
        let store = self.config.store();
        let current = match self.with_storage_retry("get", || store.get(leased.id))? {
            Some(task) => task,
            None => return Ok(skipped(&leased, SkipReason::NotFound)),
        };
        if current.status == TaskStatus::Cancelled {
            return Ok(skipped(&current, SkipReason::Cancelled));
        }
        if current.status != TaskStatus::Running || current.version != leased.version {
            return Ok(skipped(&current, SkipReason::LeaseLost));
        }
        let mut task = current;

        let (invocation, predicate, target) = match self.prepare(&task) {
            Ok(prepared) => prepared,
            Err(err) => return self.fail_fatally(task, err),
        };

        let attempt = task.attempt_count + 1;
        let mut started = self.event(RetryEventKind::AttemptStarted, &task);
        started.attempt = attempt;

        let ctx = AttemptContext {
            invocation: &invocation,
            task_id: Some(task.id),
            biz_id: task.biz_id.as_deref(),
            attempt,
        };
        // Announced from the terminal link, so a vetoed replay stays silent.
        let filtered = self.filters.execute(&ctx, &|| {
            self.publish(started.clone());
            invoke_guarded(target.as_ref(), invocation.method(), invocation.args())
        });

        let now = Utc::now();
        let strategies = self.config.strategies();

        let outcome = match filtered {
            FilterOutcome::Completed(outcome) => outcome,
            FilterOutcome::Vetoed(veto) => {
                let delay =
                    strategies.compute_delay(&task.strategy, task.attempt_count.max(1), now);
                task.defer(after(now, delay), now);
                return Ok(match self.persist(task)? {
                    Persisted::Stored(task) => {
                        debug!(
                            task_id = %task.id,
                            veto = %veto,
                            next_eligible_at = %task.next_eligible_at,
                            "replay vetoed; task deferred"
                        );
                        AttemptReport::Vetoed(veto)
                    }
                    Persisted::Lost(reason) => AttemptReport::Skipped(reason),
                });
            }
        };

        let verdict = match predicate.evaluate(&outcome, self.config.predicates()) {
            Ok(verdict) => verdict,
            Err(err) => return self.fail_fatally(task, err),
        };

        if verdict == Verdict::Accept {
            task.record_success(now);
            let task = match self.persist(task)? {
                Persisted::Stored(task) => task,
                Persisted::Lost(reason) => return Ok(AttemptReport::Skipped(reason)),
            };
            self.clean_up(&task);
            info!(task_id = %task.id, attempts = task.attempt_count, "retry task succeeded");
            self.publish(self.event(RetryEventKind::AttemptSucceeded, &task));
            return Ok(AttemptReport::Succeeded);
        }

        let failure = rejection(&outcome);
        if strategies.should_stop(&task.strategy, attempt, task.elapsed(now)) {
            task.record_failure_and_exhaust(failure.to_string(), now);
            let task = match self.persist(task)? {
                Persisted::Stored(task) => task,
                Persisted::Lost(reason) => return Ok(AttemptReport::Skipped(reason)),
            };
            warn!(
                task_id = %task.id,
                attempts = task.attempt_count,
                error = %failure,
                "retry task exhausted"
            );
            self.publish(
                self.event(RetryEventKind::TaskExhausted, &task)
                    .with_error(task.last_error.clone()),
            );
            return Ok(AttemptReport::Exhausted { fatal: false });
        }

        let delay = strategies.compute_delay(&task.strategy, attempt, now);
        task.record_failure_and_schedule(failure.to_string(), after(now, delay), now);
        let task = match self.persist(task)? {
            Persisted::Stored(task) => task,
            Persisted::Lost(reason) => return Ok(AttemptReport::Skipped(reason)),
        };
        debug!(
            task_id = %task.id,
            attempts = task.attempt_count,
            next_eligible_at = %task.next_eligible_at,
            error = %failure,
            "retry attempt failed; rescheduled"
        );
        self.publish(
            self.event(RetryEventKind::AttemptRetrying, &task)
                .with_next_eligible_at(task.next_eligible_at)
                .with_error(task.last_error.clone()),
        );
        Ok(AttemptReport::Retrying {
            next_eligible_at: task.next_eligible_at,
        })
    }

    /// Hand a leased task back to the store without attempting it.
    pub fn release_lease(&self, task: &RetryTask) -> Result<(), RetryError> {
        let mut released = task.clone();
        released.release(Utc::now());
        if let Persisted::Stored(task) = self.persist(released)? {
            debug!(task_id = %task.id, "lease released");
        }
        Ok(())
    }

    fn prepare(&self, task: &RetryTask) -> Result<Prepared, RetryError> {
        let serializers = self.config.serializers();
        let invocation = serializers.invocation.decode(&task.invocation)?;
        let predicate = serializers.predicate.decode(&task.predicate)?;
        predicate.validate(self.config.predicates())?;
        let target = resolve_target(self.config.resolver(), invocation.target(), invocation.method())?;
        Ok((invocation, predicate, target))
    }

    fn fail_fatally(&self, mut task: RetryTask, err: RetryError) -> Result<AttemptReport, RetryError> {
        error!(task_id = %task.id, error = %err, "retry task cannot be replayed");
        task.mark_fatal(&err, Utc::now());
        match self.persist(task)? {
            Persisted::Stored(task) => {
                self.publish(
                    self.event(RetryEventKind::TaskExhausted, &task)
                        .with_error(task.last_error.clone()),
                );
                Ok(AttemptReport::Exhausted { fatal: true })
            }
            Persisted::Lost(reason) => Ok(AttemptReport::Skipped(reason)),
        }
    }

    fn clean_up(&self, task: &RetryTask) {
        let store = self.config.store();
        let result = match self.config.settings().cleanup {
            CleanupPolicy::Archive => self.with_storage_retry("archive", || store.archive(task.id)),
            CleanupPolicy::Delete => self.with_storage_retry("delete", || store.delete(task.id)),
        };
        // The task is already terminal, so a failed cleanup only leaves it in
        // the live set for inspection.
        if let Err(err) = result {
            warn!(task_id = %task.id, error = %err, "failed to clean up succeeded task");
        }
    }

    fn create(&self, task: &RetryTask) -> Result<TaskId, RetryError> {
        let store = self.config.store();
        Ok(self.with_storage_retry("create", || store.create(task.clone()))?)
    }

    /// Write `task`; a lost optimistic race is reported, not raised.
    fn persist(&self, task: RetryTask) -> Result<Persisted, RetryError> {
        let store = self.config.store();
        match self.with_storage_retry("update", || store.update(&task)) {
            Ok(stored) => Ok(Persisted::Stored(stored)),
            Err(TaskStoreError::Conflict(_) | TaskStoreError::NotFound(_)) => {
                let reason = match self.with_storage_retry("get", || store.get(task.id))? {
                    Some(current) if current.status == TaskStatus::Cancelled => SkipReason::Cancelled,
                    Some(_) => SkipReason::LeaseLost,
                    None => SkipReason::NotFound,
                };
                info!(task_id = %task.id, reason = ?reason, "attempt result discarded");
                Ok(Persisted::Lost(reason))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Retry transient store failures with exponential backoff.
    fn with_storage_retry<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> Result<T, TaskStoreError>,
    ) -> Result<T, TaskStoreError> {
        let settings = self.config.settings();
        let attempts = settings.storage_retry_attempts.max(1);
        let mut delay = settings.storage_retry_base();
        let mut tried = 0;
        loop {
            tried += 1;
            match op() {
                Err(err) if err.is_transient() => {
                    self.health.record_failure(operation, &err.to_string());
                    if tried >= attempts {
                        return Err(err);
                    }
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                result => {
                    self.health.record_success();
                    return result;
                }
            }
        }
    }

    fn event(&self, kind: RetryEventKind, task: &RetryTask) -> RetryEvent {
        RetryEvent::new(kind, task.id, &task.target, &task.method, task.attempt_count)
            .with_biz_id(task.biz_id.clone())
    }

    fn publish(&self, event: RetryEvent) {
        let report = self.config.multicaster().publish(&event);
        if report.failed > 0 {
            debug!(
                event = %event.kind,
                task_id = %event.task_id,
                failed = report.failed,
                "some retry listeners failed"
            );
        }
    }
}

fn skipped(task: &RetryTask, reason: SkipReason) -> AttemptReport {
    debug!(task_id = %task.id, status = %task.status, reason = ?reason, "attempt skipped");
    AttemptReport::Skipped(reason)
}

/// A rejected outcome, as recorded on the task.
fn rejection(outcome: &CallOutcome) -> RetryError {
    match outcome {
        Err(failure) => RetryError::transient(failure.to_string()),
        Ok(value) => RetryError::transient(format!("result rejected by predicate: {value:?}")),
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
