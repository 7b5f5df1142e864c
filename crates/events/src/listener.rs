//! Listener contract.

use crate::event::{RetryEvent, RetryEventKind};

/// Listener failure. Reported by the multicaster, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Receives retry lifecycle events.
///
/// Called synchronously on the publishing thread, so implementations should
/// hand slow work off elsewhere (see [`crate::ChannelListener`]).
pub trait RetryListener: Send + Sync {
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Whether this listener wants events of `kind` at all.
    fn accepts(&self, _kind: RetryEventKind) -> bool {
        true
    }

    fn on_event(&self, event: &RetryEvent) -> Result<(), ListenerError>;
}

/// Listener backed by a closure.
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&RetryEvent) -> Result<(), ListenerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> RetryListener for FnListener<F>
where
    F: Fn(&RetryEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &RetryEvent) -> Result<(), ListenerError> {
        (self.f)(event)
    }
}
