//! Filters shipped with the runtime.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{AttemptContext, FilterError, FilterOutcome, FilterRegistration, Next, RetryFilter, Veto};

/// Logs every attempt and how it ended.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFilter;

impl LoggingFilter {
    pub const NAME: &'static str = "logging";

    pub fn registration(order: i32) -> FilterRegistration {
        FilterRegistration::new(Self::NAME, order, LoggingFilter)
    }
}

impl RetryFilter for LoggingFilter {
    fn intercept(
        &self,
        ctx: &AttemptContext<'_>,
        next: Next<'_>,
    ) -> Result<FilterOutcome, FilterError> {
        let started = Instant::now();
        let task_id = ctx.task_id.map(|id| id.to_string());
        debug!(
            retry_target = ctx.invocation.target(),
            method = %ctx.invocation.method(),
            attempt = ctx.attempt,
            task_id = ?task_id,
            "attempt starting"
        );

        let outcome = next.proceed(ctx);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            FilterOutcome::Completed(Ok(_)) => debug!(
                retry_target = ctx.invocation.target(),
                attempt = ctx.attempt,
                elapsed_ms,
                "attempt returned"
            ),
            FilterOutcome::Completed(Err(failure)) => info!(
                retry_target = ctx.invocation.target(),
                attempt = ctx.attempt,
                task_id = ?task_id,
                elapsed_ms,
                error = %failure,
                "attempt failed"
            ),
            FilterOutcome::Vetoed(veto) => info!(
                retry_target = ctx.invocation.target(),
                attempt = ctx.attempt,
                task_id = ?task_id,
                filter = %veto.filter,
                reason = %veto.reason,
                "attempt vetoed"
            ),
        }

        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct Circuit {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// The single half-open trial is running.
    trial_running: bool,
}

/// Per-target circuit breaker.
///
/// After `failure_threshold` consecutive failed calls to a target, attempts
/// against it are vetoed for `cool_down`. Once the cool-down has passed the
/// circuit is half-open: exactly one trial attempt goes through while the
/// others keep being vetoed. A successful trial closes the circuit, a failed
/// one reopens it for another cool-down.
#[derive(Debug)]
pub struct CircuitBreakerFilter {
    failure_threshold: u32,
    cool_down: Duration,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreakerFilter {
    pub const NAME: &'static str = "circuit_breaker";

    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cool_down,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn registration(self, order: i32) -> FilterRegistration {
        FilterRegistration::new(Self::NAME, order, self)
    }

    /// Whether attempts against `target` are currently vetoed for cool-down.
    pub fn is_open(&self, target: &str) -> bool {
        self.circuits()
            .get(target)
            .and_then(|c| c.opened_at)
            .is_some_and(|at| at.elapsed() < self.cool_down)
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        // Circuits are updated whole under the lock, so a poisoned table is
        // still consistent; recovering it also guarantees the trial flag is
        // cleared.
        self.circuits.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Decide whether an attempt may run. `Ok(true)` marks the half-open
    /// trial.
    fn admit(&self, target: &str) -> Result<bool, Veto> {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(target.to_string()).or_default();
        match circuit.opened_at {
            None => Ok(false),
            Some(at) if at.elapsed() < self.cool_down => {
                Err(Veto::new(Self::NAME, format!("circuit open for {target}")))
            }
            Some(_) if circuit.trial_running => Err(Veto::new(
                Self::NAME,
                format!("trial attempt already running for {target}"),
            )),
            Some(_) => {
                circuit.trial_running = true;
                Ok(true)
            }
        }
    }
}

impl RetryFilter for CircuitBreakerFilter {
    fn intercept(
        &self,
        ctx: &AttemptContext<'_>,
        next: Next<'_>,
    ) -> Result<FilterOutcome, FilterError> {
        let target = ctx.invocation.target();
        let trial = match self.admit(target) {
            Ok(trial) => trial,
            Err(veto) => return Ok(FilterOutcome::Vetoed(veto)),
        };

        let outcome = next.proceed(ctx);

        let mut circuits = self.circuits();
        let circuit = circuits.entry(target.to_string()).or_default();
        if trial {
            circuit.trial_running = false;
        }
        // A veto further down says nothing about the target.
        if let FilterOutcome::Completed(result) = &outcome {
            if result.is_ok() {
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
            } else {
                circuit.consecutive_failures += 1;
                if trial || circuit.consecutive_failures >= self.failure_threshold {
                    circuit.opened_at = Some(Instant::now());
                    warn!(
                        retry_target = target,
                        failures = circuit.consecutive_failures,
                        cool_down_ms = self.cool_down.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
        }

        Ok(outcome)
    }
}
