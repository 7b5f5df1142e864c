//! Persisted retry task record and its state transitions.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::id::TaskId;
use crate::serializer::EncodedBlob;
use crate::strategy::{StopPolicy, WaitPolicy};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its next eligible time
    Pending,
    /// Leased by exactly one in-flight attempt
    Running,
    /// Result accepted by the predicate
    Succeeded,
    /// Stop strategy fired, or the task can never be replayed
    Exhausted,
    /// Cancelled by an operator
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Exhausted | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Exhausted => "exhausted",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "exhausted" => Ok(TaskStatus::Exhausted),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(RetryError::serialization(format!("unknown task status: {other}"))),
        }
    }
}

/// Per-task replacement for the global wait/stop strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StrategyOverride {
    pub wait: Option<WaitPolicy>,
    pub stop: Option<StopPolicy>,
}

impl StrategyOverride {
    pub fn is_empty(&self) -> bool {
        self.wait.is_none() && self.stop.is_none()
    }
}

/// A durable retry lifecycle for one captured call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTask {
    pub id: TaskId,
    /// Caller-supplied correlation key
    pub biz_id: Option<String>,
    /// Target name, kept readable for inspection
    pub target: String,
    /// Method signature, kept readable for inspection
    pub method: String,
    pub invocation: EncodedBlob,
    pub predicate: EncodedBlob,
    pub strategy: StrategyOverride,
    /// Completed attempts (the original call counts as the first)
    pub attempt_count: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    /// Set when the task can never be replayed (decode or resolution failure)
    pub terminal_error: bool,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: u64,
    pub leased_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryTask {
    /// Create a pending task with no completed attempts.
    pub fn new(
        target: impl Into<String>,
        method: impl Into<String>,
        invocation: EncodedBlob,
        predicate: EncodedBlob,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            biz_id: None,
            target: target.into(),
            method: method.into(),
            invocation,
            predicate,
            strategy: StrategyOverride::default(),
            attempt_count: 0,
            next_eligible_at: now,
            status: TaskStatus::Pending,
            last_error: None,
            terminal_error: false,
            version: 0,
            leased_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_biz_id(mut self, biz_id: Option<String>) -> Self {
        self.biz_id = biz_id;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyOverride) -> Self {
        self.strategy = strategy;
        self
    }

    /// Pending and past its next eligible time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_eligible_at <= now
    }

    /// Time since the task was captured.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// PENDING → RUNNING.
    pub fn lease(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.leased_at = Some(now);
        self.updated_at = now;
    }

    /// Push a held lease forward. Only RUNNING tasks are touched and the
    /// lease never moves backwards.
    pub fn renew_lease(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::Running {
            self.leased_at = Some(self.leased_at.map_or(now, |at| at.max(now)));
        }
    }

    /// RUNNING → PENDING without counting an attempt.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.leased_at = None;
        self.updated_at = now;
    }

    /// Release the lease and push the next eligible time out without
    /// counting an attempt.
    pub fn defer(&mut self, next_eligible_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.release(now);
        self.next_eligible_at = self.strictly_after_previous(next_eligible_at);
    }

    /// An attempt completed and its result was accepted.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.status = TaskStatus::Succeeded;
        self.leased_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// An attempt completed, was rejected, and another one is scheduled.
    pub fn record_failure_and_schedule(
        &mut self,
        error: String,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.attempt_count += 1;
        self.status = TaskStatus::Pending;
        self.leased_at = None;
        self.last_error = Some(error);
        self.next_eligible_at = self.strictly_after_previous(next_eligible_at);
        self.updated_at = now;
    }

    /// An attempt completed, was rejected, and the stop strategy fired.
    pub fn record_failure_and_exhaust(&mut self, error: String, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.status = TaskStatus::Exhausted;
        self.leased_at = None;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// The task cannot be replayed at all; no attempt ran.
    pub fn mark_fatal(&mut self, error: &RetryError, now: DateTime<Utc>) {
        self.status = TaskStatus::Exhausted;
        self.terminal_error = true;
        self.leased_at = None;
        self.last_error = Some(error.to_string());
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.leased_at = None;
        self.updated_at = now;
    }

    fn strictly_after_previous(&self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.next_eligible_at + chrono::Duration::milliseconds(1);
        candidate.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(now: DateTime<Utc>) -> RetryTask {
        RetryTask::new(
            "billing",
            "charge(str, int)",
            EncodedBlob::new("inv", vec![1]),
            EncodedBlob::new("pred", vec![2]),
            now,
        )
    }

    #[test]
    fn task_lifecycle() {
        let now = Utc::now();
        let mut t = task(now);
        assert!(t.is_due(now));
        assert_eq!(t.attempt_count, 0);

        t.lease(now);
        assert_eq!(t.status, TaskStatus::Running);
        assert!(!t.is_due(now));

        t.record_success(now);
        assert_eq!(t.status, TaskStatus::Succeeded);
        assert_eq!(t.attempt_count, 1);
        assert!(t.status.is_terminal());
    }

    #[test]
    fn failure_schedules_strictly_later() {
        let now = Utc::now();
        let mut t = task(now);
        t.lease(now);
        // A zero delay still moves the eligible time forward.
        t.record_failure_and_schedule("io: reset".into(), now, now);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempt_count, 1);
        assert!(t.next_eligible_at > now);
        assert_eq!(t.last_error.as_deref(), Some("io: reset"));
    }

    #[test]
    fn exhaust_and_fatal_differ_in_attempts() {
        let now = Utc::now();
        let mut exhausted = task(now);
        exhausted.record_failure_and_exhaust("boom".into(), now);
        assert_eq!(exhausted.attempt_count, 1);
        assert!(!exhausted.terminal_error);

        let mut fatal = task(now);
        fatal.mark_fatal(&RetryError::serialization("bad bytes"), now);
        assert_eq!(fatal.attempt_count, 0);
        assert!(fatal.terminal_error);
        assert_eq!(fatal.status, TaskStatus::Exhausted);
    }

    #[test]
    fn defer_keeps_attempt_count() {
        let now = Utc::now();
        let mut t = task(now);
        t.lease(now);
        t.defer(now + chrono::Duration::seconds(5), now);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempt_count, 0);
        assert!(t.leased_at.is_none());
    }

    #[test]
    fn renewal_only_extends_running_leases() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);
        let mut t = task(now);

        t.renew_lease(later);
        assert!(t.leased_at.is_none());

        t.lease(now);
        t.renew_lease(later);
        assert_eq!(t.leased_at, Some(later));
        t.renew_lease(now);
        assert_eq!(t.leased_at, Some(later));
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn status_parses_its_own_display() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Exhausted,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<TaskStatus>().unwrap(), s);
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Fail(i64),
            Defer(i64),
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![
                (-5_000i64..60_000).prop_map(Step::Fail),
                (-5_000i64..60_000).prop_map(Step::Defer),
            ]
        }

        proptest! {
            /// Property: attempt count rises by exactly one per completed attempt
            /// and the eligible time strictly increases between pending states.
            #[test]
            fn attempts_and_eligibility_only_move_forward(steps in proptest::collection::vec(step(), 1..30)) {
                let start = Utc::now();
                let mut t = task(start);
                for (i, s) in steps.into_iter().enumerate() {
                    let now = start + chrono::Duration::milliseconds(i as i64 * 10);
                    let before_attempts = t.attempt_count;
                    let before_next = t.next_eligible_at;
                    t.lease(now);
                    match s {
                        Step::Fail(offset) => {
                            t.record_failure_and_schedule(
                                "x".into(),
                                now + chrono::Duration::milliseconds(offset),
                                now,
                            );
                            prop_assert_eq!(t.attempt_count, before_attempts + 1);
                        }
                        Step::Defer(offset) => {
                            t.defer(now + chrono::Duration::milliseconds(offset), now);
                            prop_assert_eq!(t.attempt_count, before_attempts);
                        }
                    }
                    prop_assert!(t.next_eligible_at > before_next);
                }
            }
        }
    }
}
