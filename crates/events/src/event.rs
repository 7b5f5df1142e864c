//! Lifecycle event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use persevere_core::TaskId;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryEventKind {
    /// A failed call was captured and persisted for retry.
    AttemptScheduled,
    /// A persisted task is about to be replayed.
    AttemptStarted,
    /// A replay's result was accepted.
    AttemptSucceeded,
    /// A replay was rejected and another attempt is scheduled.
    AttemptRetrying,
    /// The task gave up (stop strategy, or it can never be replayed).
    TaskExhausted,
}

impl RetryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryEventKind::AttemptScheduled => "ATTEMPT_SCHEDULED",
            RetryEventKind::AttemptStarted => "ATTEMPT_STARTED",
            RetryEventKind::AttemptSucceeded => "ATTEMPT_SUCCEEDED",
            RetryEventKind::AttemptRetrying => "ATTEMPT_RETRYING",
            RetryEventKind::TaskExhausted => "TASK_EXHAUSTED",
        }
    }
}

impl core::fmt::Display for RetryEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event for one task.
///
/// `attempt` is the attempt the event refers to: for `AttemptStarted` the one
/// about to run, otherwise the one just completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEvent {
    pub event_id: Uuid,
    pub kind: RetryEventKind,
    pub task_id: TaskId,
    pub biz_id: Option<String>,
    pub target: String,
    pub method: String,
    pub attempt: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl RetryEvent {
    pub fn new(
        kind: RetryEventKind,
        task_id: TaskId,
        target: impl Into<String>,
        method: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            task_id,
            biz_id: None,
            target: target.into(),
            method: method.into(),
            attempt,
            next_eligible_at: None,
            error: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_biz_id(mut self, biz_id: Option<String>) -> Self {
        self.biz_id = biz_id;
        self
    }

    pub fn with_next_eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_eligible_at = Some(at);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_screaming_case() {
        let json = serde_json::to_string(&RetryEventKind::TaskExhausted).unwrap();
        assert_eq!(json, "\"TASK_EXHAUSTED\"");
        assert_eq!(RetryEventKind::AttemptRetrying.to_string(), "ATTEMPT_RETRYING");
    }

    #[test]
    fn builder_fills_optional_fields() {
        let at = Utc::now();
        let ev = RetryEvent::new(RetryEventKind::AttemptRetrying, TaskId::new(), "billing", "charge()", 2)
            .with_biz_id(Some("order-7".into()))
            .with_next_eligible_at(at)
            .with_error(Some("timeout: upstream".into()));
        assert_eq!(ev.attempt, 2);
        assert_eq!(ev.biz_id.as_deref(), Some("order-7"));
        assert_eq!(ev.next_eligible_at, Some(at));
        assert!(ev.error.is_some());
    }
}
