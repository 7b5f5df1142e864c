//! Captured method calls.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::value::{ArgValue, ParamType};

/// Method identity: name plus parameter signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId {
    pub name: String,
    pub params: Vec<ParamType>,
}

impl MethodId {
    pub fn new(name: impl Into<String>, params: impl IntoIterator<Item = ParamType>) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().collect(),
        }
    }

    /// Check that `args` fit this signature.
    pub fn check_args(&self, args: &[ArgValue]) -> Result<(), RetryError> {
        if args.len() != self.params.len() {
            return Err(RetryError::invalid_invocation(format!(
                "{self} expects {} argument(s), got {}",
                self.params.len(),
                args.len()
            )));
        }
        for (idx, (param, arg)) in self.params.iter().zip(args).enumerate() {
            if !param.accepts(arg) {
                return Err(RetryError::invalid_invocation(format!(
                    "{self}: argument {idx} is {}, expected {param}",
                    arg.type_name()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (idx, p) in self.params.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        f.write_str(")")
    }
}

/// An immutable capture of "what to call".
///
/// `target` is the name the executor resolver maps back to a live object at
/// replay time; nothing about the original caller's stack is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    target: String,
    method: MethodId,
    args: Vec<ArgValue>,
}

impl Invocation {
    /// Capture a call, validating the arguments against the signature.
    pub fn new(
        target: impl Into<String>,
        method: MethodId,
        args: Vec<ArgValue>,
    ) -> Result<Self, RetryError> {
        let target = target.into();
        if target.is_empty() {
            return Err(RetryError::invalid_invocation("target name is empty"));
        }
        method.check_args(&args)?;
        Ok(Self {
            target,
            method,
            args,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.target, self.method)
    }
}

/// Error raised by a wrapped call.
///
/// `kind` is a stable classification the result predicates can match on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InvocationFailure {
    pub kind: String,
    pub message: String,
}

impl InvocationFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// What a single call produced.
pub type CallOutcome = Result<ArgValue, InvocationFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    fn charge() -> MethodId {
        MethodId::new("charge", [ParamType::Str, ParamType::Int])
    }

    #[test]
    fn captures_valid_call() {
        let inv = Invocation::new("billing", charge(), vec!["acct-1".into(), 300i64.into()])
            .unwrap();
        assert_eq!(inv.target(), "billing");
        assert_eq!(inv.args().len(), 2);
        assert_eq!(inv.to_string(), "billing::charge(str, int)");
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = Invocation::new("billing", charge(), vec!["acct-1".into()]).unwrap_err();
        assert!(matches!(err, RetryError::InvalidInvocation(_)));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = Invocation::new("billing", charge(), vec![1i64.into(), 300i64.into()])
            .unwrap_err();
        assert!(err.to_string().contains("argument 0 is int"));
    }

    #[test]
    fn rejects_empty_target() {
        assert!(Invocation::new("", MethodId::new("noop", []), vec![]).is_err());
    }
}
