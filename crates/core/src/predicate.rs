//! Result-acceptance predicates.
//!
//! A predicate decides whether a call's outcome ends the retry lifecycle. It
//! is persisted next to the invocation, so it is plain data rather than a
//! closure; arbitrary logic is reachable through `Named`, which refers to a
//! function registered in a [`PredicateRegistry`] at startup.
//!
//! A registered function that panics is reported as a serialization error,
//! which ends the task it was evaluated for.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::invocation::CallOutcome;
use crate::target::panic_message;
use crate::value::ArgValue;

/// Classification of one attempt's outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// A serializable acceptance predicate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ResultPredicate {
    /// Accept any successful return.
    #[default]
    NoError,
    /// Accept a successful return equal to `value`.
    ResultEquals { value: ArgValue },
    /// Accept a successful, non-null return.
    ResultNotNull,
    /// Accept failures of the listed kinds (they are final, not retryable).
    ErrorKindIn { kinds: Vec<String> },
    Not { inner: Box<ResultPredicate> },
    All { of: Vec<ResultPredicate> },
    Any { of: Vec<ResultPredicate> },
    /// Delegate to a registered function.
    Named { name: String },
}

impl ResultPredicate {
    pub fn named(name: impl Into<String>) -> Self {
        ResultPredicate::Named { name: name.into() }
    }

    pub fn negate(self) -> Self {
        ResultPredicate::Not {
            inner: Box::new(self),
        }
    }

    /// "Succeeded, or failed with one of these kinds."
    pub fn no_error_or_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResultPredicate::Any {
            of: vec![
                ResultPredicate::NoError,
                ResultPredicate::ErrorKindIn {
                    kinds: kinds.into_iter().map(Into::into).collect(),
                },
            ],
        }
    }

    pub fn evaluate(
        &self,
        outcome: &CallOutcome,
        registry: &PredicateRegistry,
    ) -> Result<Verdict, RetryError> {
        Ok(if self.test(outcome, registry)? {
            Verdict::Accept
        } else {
            Verdict::Reject
        })
    }

    fn test(&self, outcome: &CallOutcome, registry: &PredicateRegistry) -> Result<bool, RetryError> {
        Ok(match self {
            ResultPredicate::NoError => outcome.is_ok(),
            ResultPredicate::ResultEquals { value } => {
                matches!(outcome, Ok(v) if v == value)
            }
            ResultPredicate::ResultNotNull => matches!(outcome, Ok(v) if !v.is_null()),
            ResultPredicate::ErrorKindIn { kinds } => {
                matches!(outcome, Err(f) if kinds.iter().any(|k| *k == f.kind))
            }
            ResultPredicate::Not { inner } => !inner.test(outcome, registry)?,
            ResultPredicate::All { of } => {
                for p in of {
                    if !p.test(outcome, registry)? {
                        return Ok(false);
                    }
                }
                true
            }
            ResultPredicate::Any { of } => {
                for p in of {
                    if p.test(outcome, registry)? {
                        return Ok(true);
                    }
                }
                false
            }
            ResultPredicate::Named { name } => {
                let f = registry.get(name).ok_or_else(|| unknown_predicate(name))?;
                catch_unwind(AssertUnwindSafe(|| f(outcome))).map_err(|payload| {
                    RetryError::serialization(format!(
                        "named predicate {name} panicked: {}",
                        panic_message(payload.as_ref())
                    ))
                })?
            }
        })
    }

    /// Check that every `Named` reference resolves.
    pub fn validate(&self, registry: &PredicateRegistry) -> Result<(), RetryError> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        match names.into_iter().find(|n| !registry.contains(n)) {
            Some(missing) => Err(unknown_predicate(missing)),
            None => Ok(()),
        }
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ResultPredicate::Named { name } => out.push(name),
            ResultPredicate::Not { inner } => inner.collect_names(out),
            ResultPredicate::All { of } | ResultPredicate::Any { of } => {
                for p in of {
                    p.collect_names(out);
                }
            }
            _ => {}
        }
    }
}

fn unknown_predicate(name: &str) -> RetryError {
    RetryError::serialization(format!("unknown named predicate: {name}"))
}

/// Registered predicate function.
pub type PredicateFn = dyn Fn(&CallOutcome) -> bool + Send + Sync;

/// Name → predicate function lookup used by `ResultPredicate::Named`.
#[derive(Default, Clone)]
pub struct PredicateRegistry {
    fns: HashMap<String, Arc<PredicateFn>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&CallOutcome) -> bool + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallOutcome) -> bool + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PredicateFn>> {
        self.fns.get(name)
    }
}

impl core::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.fns.keys().collect();
        names.sort();
        f.debug_struct("PredicateRegistry")
            .field("names", &names)
            .finish()
    }
}
