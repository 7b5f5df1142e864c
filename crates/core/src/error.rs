//! Retry error taxonomy.

use thiserror::Error;

/// Result type used across the retry engine.
pub type RetryResult<T> = Result<T, RetryError>;

/// Engine-level error.
///
/// The first three variants are fatal for the task they concern: replaying it
/// again cannot succeed, so the task is moved to `Exhausted` with its terminal
/// flag set. `TransientExecution` drives normal retry scheduling and `Storage`
/// is retried at the executor/scheduler boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Bytes could not be produced or read back (malformed layout, unknown
    /// composite type), or a named predicate is missing or panicked.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The persisted target or method no longer resolves at replay time.
    #[error("target resolution failed: {0}")]
    TargetResolution(String),

    /// Arguments do not fit the declared method signature.
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    /// The wrapped call failed and the result predicate rejected it.
    #[error("transient execution failure: {0}")]
    TransientExecution(String),

    /// The task store could not complete an operation.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RetryError {
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn target_resolution(msg: impl Into<String>) -> Self {
        Self::TargetResolution(msg.into())
    }

    pub fn invalid_invocation(msg: impl Into<String>) -> Self {
        Self::InvalidInvocation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientExecution(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether this error ends the task for good.
    pub fn is_fatal_for_task(&self) -> bool {
        matches!(
            self,
            RetryError::Serialization(_)
                | RetryError::TargetResolution(_)
                | RetryError::InvalidInvocation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_taxonomy() {
        assert!(RetryError::serialization("x").is_fatal_for_task());
        assert!(RetryError::target_resolution("x").is_fatal_for_task());
        assert!(RetryError::invalid_invocation("x").is_fatal_for_task());
        assert!(!RetryError::transient("x").is_fatal_for_task());
        assert!(!RetryError::storage("x").is_fatal_for_task());
    }
}
