//! Wait and stop strategies.
//!
//! Both are pure functions of the attempt number and time, so they can be
//! swapped globally or per task without touching persisted state.

use core::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay before the next attempt.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// `attempt` is the number of attempts completed so far (1-indexed).
    fn compute_delay(&self, attempt: u32, last_attempt_at: DateTime<Utc>) -> Duration;
}

/// Whether to give up.
pub trait StopStrategy: Send + Sync + fmt::Debug {
    /// `attempt` is the number of attempts completed so far; `elapsed` is the
    /// time since the task was first captured.
    fn should_stop(&self, attempt: u32, elapsed: Duration) -> bool;
}

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Fixed delay between retries
    #[default]
    #[serde(alias = "FIXED")]
    Fixed,
    /// Linear backoff: base * attempt
    #[serde(alias = "LINEAR")]
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[serde(alias = "EXPONENTIAL")]
    Exponential,
}

/// Configurable wait policy: `{kind, base, max}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub max: Duration,
}

impl WaitPolicy {
    /// Build a policy; `max` is raised to `base` when smaller so the curve
    /// never dips.
    pub fn new(kind: BackoffKind, base: Duration, max: Duration) -> Self {
        Self {
            kind,
            base,
            max: max.max(base),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(BackoffKind::Fixed, delay, delay)
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self::new(BackoffKind::Linear, base, max)
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(BackoffKind::Exponential, base, max)
    }

    /// Delay after `attempt` completed attempts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.kind {
            BackoffKind::Fixed => return self.base,
            BackoffKind::Linear => self.base.checked_mul(attempt),
            BackoffKind::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.base.checked_mul(factor)),
        };
        raw.map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl WaitStrategy for WaitPolicy {
    fn compute_delay(&self, attempt: u32, _last_attempt_at: DateTime<Utc>) -> Duration {
        self.delay_for_attempt(attempt)
    }
}

/// Configurable stop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopPolicy {
    /// Stop once this many attempts have completed.
    MaxAttempts { attempts: u32 },
    /// Stop once the task is older than `elapsed`.
    MaxElapsed { elapsed: Duration },
    /// Stop on whichever bound is hit first.
    AttemptsOrElapsed { attempts: u32, elapsed: Duration },
}

impl StopPolicy {
    pub fn max_attempts(attempts: u32) -> Self {
        StopPolicy::MaxAttempts { attempts }
    }

    pub fn max_elapsed(elapsed: Duration) -> Self {
        StopPolicy::MaxElapsed { elapsed }
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::max_attempts(5)
    }
}

impl StopStrategy for StopPolicy {
    fn should_stop(&self, attempt: u32, elapsed: Duration) -> bool {
        match *self {
            StopPolicy::MaxAttempts { attempts } => attempt >= attempts,
            StopPolicy::MaxElapsed { elapsed: limit } => elapsed >= limit,
            StopPolicy::AttemptsOrElapsed {
                attempts,
                elapsed: limit,
            } => attempt >= attempts || elapsed >= limit,
        }
    }
}

/// Wait strategy backed by a closure.
pub struct CustomWait<F> {
    name: &'static str,
    f: F,
}

impl<F> CustomWait<F>
where
    F: Fn(u32, DateTime<Utc>) -> Duration + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for CustomWait<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomWait").field(&self.name).finish()
    }
}

impl<F> WaitStrategy for CustomWait<F>
where
    F: Fn(u32, DateTime<Utc>) -> Duration + Send + Sync,
{
    fn compute_delay(&self, attempt: u32, last_attempt_at: DateTime<Utc>) -> Duration {
        (self.f)(attempt, last_attempt_at)
    }
}

/// Stop strategy backed by a closure.
pub struct CustomStop<F> {
    name: &'static str,
    f: F,
}

impl<F> CustomStop<F>
where
    F: Fn(u32, Duration) -> bool + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for CustomStop<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomStop").field(&self.name).finish()
    }
}

impl<F> StopStrategy for CustomStop<F>
where
    F: Fn(u32, Duration) -> bool + Send + Sync,
{
    fn should_stop(&self, attempt: u32, elapsed: Duration) -> bool {
        (self.f)(attempt, elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = WaitPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = WaitPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = WaitPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = WaitPolicy::linear(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn max_below_base_is_raised() {
        let policy = WaitPolicy::linear(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
    }

    #[test]
    fn stop_respects_max_attempts() {
        let stop = StopPolicy::max_attempts(3);

        assert!(!stop.should_stop(1, Duration::ZERO));
        assert!(!stop.should_stop(2, Duration::ZERO));
        assert!(stop.should_stop(3, Duration::ZERO));
        assert!(stop.should_stop(4, Duration::ZERO));
    }

    #[test]
    fn stop_on_either_bound() {
        let stop = StopPolicy::AttemptsOrElapsed {
            attempts: 10,
            elapsed: Duration::from_secs(60),
        };
        assert!(!stop.should_stop(2, Duration::from_secs(10)));
        assert!(stop.should_stop(2, Duration::from_secs(60)));
        assert!(stop.should_stop(10, Duration::ZERO));
    }

    #[test]
    fn custom_strategies_delegate() {
        let wait = CustomWait::new("square", |attempt, _| {
            Duration::from_millis(u64::from(attempt * attempt))
        });
        let stop = CustomStop::new("never", |_, _| false);
        assert_eq!(wait.compute_delay(3, Utc::now()), Duration::from_millis(9));
        assert!(!stop.should_stop(1_000, Duration::from_secs(86_400)));
        assert_eq!(format!("{wait:?}"), "CustomWait(\"square\")");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn kind() -> impl Strategy<Value = BackoffKind> {
            prop_oneof![
                Just(BackoffKind::Fixed),
                Just(BackoffKind::Linear),
                Just(BackoffKind::Exponential),
            ]
        }

        proptest! {
            /// Property: delays never shrink as attempts grow, and stay within max.
            #[test]
            fn delay_is_monotonic_and_bounded(
                kind in kind(),
                base_ms in 1u64..10_000,
                max_ms in 1u64..1_000_000,
                attempt in 1u32..200,
            ) {
                let policy = WaitPolicy::new(
                    kind,
                    Duration::from_millis(base_ms),
                    Duration::from_millis(max_ms),
                );
                let now = policy.delay_for_attempt(attempt);
                let next = policy.delay_for_attempt(attempt + 1);
                prop_assert!(next >= now);
                prop_assert!(now <= policy.max);
                prop_assert!(now >= policy.base.min(policy.max));
            }
        }
    }
}
