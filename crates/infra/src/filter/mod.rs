//! Filter chain wrapped around every attempt.
//!
//! Filters are interceptors in the style of HTTP middleware. Each one sees
//! the [`AttemptContext`] and a [`Next`] handle for the rest of the chain,
//! and decides whether to proceed:
//!
//! ```ignore
//! impl RetryFilter for Maintenance {
//!     fn intercept(&self, ctx: &AttemptContext<'_>, next: Next<'_>)
//!         -> Result<FilterOutcome, FilterError>
//!     {
//!         if self.window_open() {
//!             return Ok(FilterOutcome::Vetoed(Veto::new("maintenance", "window open")));
//!         }
//!         Ok(next.proceed(ctx))
//!     }
//! }
//! ```
//!
//! Filters run in ascending `order`, lowest outermost; the terminal link
//! invokes the target. Returning [`FilterOutcome::Vetoed`] without
//! proceeding is a normal outcome, not an error. On the original attempt a
//! veto goes straight back to the caller and no task is created; on a replay
//! the task is deferred without counting an attempt.
//!
//! ## Registration
//!
//! [`FilterProvider`]s are enumerated once by [`FilterRegistry::discover`]
//! and the result is frozen into an immutable chain. Later `register` and
//! `unregister` calls build a new chain and swap it in; attempts already
//! running keep the chain they started with.
//!
//! ## Isolation
//!
//! A filter that errors or panics is logged and skipped. The target is never
//! invoked more than once per attempt: if a filter fails after the terminal
//! link already ran, the recorded outcome is returned as-is.

mod builtin;
mod registry;

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use persevere_core::{CallOutcome, Invocation, TaskId};

pub use builtin::{CircuitBreakerFilter, LoggingFilter};
pub use registry::FilterRegistry;

/// What a filter sees about the attempt it wraps.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub invocation: &'a Invocation,
    /// `None` on the caller's original attempt
    pub task_id: Option<TaskId>,
    pub biz_id: Option<&'a str>,
    /// 1 for the original call, 2 for the first replay, ...
    pub attempt: u32,
}

impl AttemptContext<'_> {
    pub fn is_replay(&self) -> bool {
        self.task_id.is_some()
    }
}

/// A filter declined to let the attempt run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    pub filter: String,
    pub reason: String,
}

impl Veto {
    pub fn new(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

impl core::fmt::Display for Veto {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "vetoed by {}: {}", self.filter, self.reason)
    }
}

/// Result of running an attempt through the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Completed(CallOutcome),
    Vetoed(Veto),
}

/// A filter's own failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("filter {filter} failed: {message}")]
pub struct FilterError {
    pub filter: String,
    pub message: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// Interceptor around a single attempt.
pub trait RetryFilter: Send + Sync {
    fn intercept(
        &self,
        ctx: &AttemptContext<'_>,
        next: Next<'_>,
    ) -> Result<FilterOutcome, FilterError>;
}

impl<T> RetryFilter for Arc<T>
where
    T: RetryFilter + ?Sized,
{
    fn intercept(
        &self,
        ctx: &AttemptContext<'_>,
        next: Next<'_>,
    ) -> Result<FilterOutcome, FilterError> {
        (**self).intercept(ctx, next)
    }
}

/// The remainder of the chain.
pub struct Next<'a> {
    rest: &'a [FilterRegistration],
    terminal: &'a dyn Fn() -> CallOutcome,
    invoked: &'a RefCell<Option<CallOutcome>>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        rest: &'a [FilterRegistration],
        terminal: &'a dyn Fn() -> CallOutcome,
        invoked: &'a RefCell<Option<CallOutcome>>,
    ) -> Self {
        Self {
            rest,
            terminal,
            invoked,
        }
    }

    /// Run the rest of the chain and, at its end, the target.
    pub fn proceed(self, ctx: &AttemptContext<'_>) -> FilterOutcome {
        let Some((head, tail)) = self.rest.split_first() else {
            let outcome = (self.terminal)();
            *self.invoked.borrow_mut() = Some(outcome.clone());
            return FilterOutcome::Completed(outcome);
        };

        let next = Next::new(tail, self.terminal, self.invoked);
        match catch_unwind(AssertUnwindSafe(|| head.filter.intercept(ctx, next))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(filter = %head.name, error = %err, "retry filter failed; skipping");
                self.skip(tail, ctx)
            }
            Err(_) => {
                warn!(filter = %head.name, "retry filter panicked; skipping");
                self.skip(tail, ctx)
            }
        }
    }

    fn skip(&self, tail: &'a [FilterRegistration], ctx: &AttemptContext<'_>) -> FilterOutcome {
        let already = self.invoked.borrow().clone();
        match already {
            Some(outcome) => FilterOutcome::Completed(outcome),
            None => Next::new(tail, self.terminal, self.invoked).proceed(ctx),
        }
    }
}

/// A named, ordered filter.
#[derive(Clone)]
pub struct FilterRegistration {
    pub name: String,
    /// Lower runs first (outermost)
    pub order: i32,
    pub filter: Arc<dyn RetryFilter>,
}

impl FilterRegistration {
    pub fn new(name: impl Into<String>, order: i32, filter: impl RetryFilter + 'static) -> Self {
        Self {
            name: name.into(),
            order,
            filter: Arc::new(filter),
        }
    }
}

impl core::fmt::Debug for FilterRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FilterRegistration")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Source of filters enumerated once at startup.
pub trait FilterProvider {
    fn filters(&self) -> Vec<FilterRegistration>;
}

impl FilterProvider for Vec<FilterRegistration> {
    fn filters(&self) -> Vec<FilterRegistration> {
        self.clone()
    }
}
