//! Replay targets and the name → instance resolver.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use crate::error::RetryError;
use crate::invocation::{CallOutcome, InvocationFailure, MethodId};
use crate::value::{ArgValue, ParamType};

/// A live object whose methods can be replayed.
pub trait RetryTarget: Send + Sync {
    /// Signatures this target exposes.
    fn methods(&self) -> Vec<MethodId>;

    /// Run `method` with `args`. Arguments have already been checked against
    /// the signature.
    fn invoke(&self, method: &MethodId, args: &[ArgValue]) -> CallOutcome;
}

/// Maps a persisted target name back to a live instance.
pub trait ExecutorResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RetryTarget>>;
}

impl<F> ExecutorResolver for F
where
    F: Fn(&str) -> Option<Arc<dyn RetryTarget>> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<Arc<dyn RetryTarget>> {
        self(name)
    }
}

/// Resolve `name` and check that `method` matches exactly one signature.
pub fn resolve_target(
    resolver: &dyn ExecutorResolver,
    name: &str,
    method: &MethodId,
) -> Result<Arc<dyn RetryTarget>, RetryError> {
    let target = resolver
        .resolve(name)
        .ok_or_else(|| RetryError::target_resolution(format!("no target named {name}")))?;
    let matches = target.methods().iter().filter(|m| *m == method).count();
    match matches {
        1 => Ok(target),
        0 => Err(RetryError::target_resolution(format!(
            "{name} has no method {method}"
        ))),
        n => Err(RetryError::target_resolution(format!(
            "{name} has {n} methods matching {method}"
        ))),
    }
}

/// Run a target method, turning a panic into a failure outcome.
pub fn invoke_guarded(target: &dyn RetryTarget, method: &MethodId, args: &[ArgValue]) -> CallOutcome {
    match catch_unwind(AssertUnwindSafe(|| target.invoke(method, args))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(InvocationFailure::new("panic", panic_message(payload.as_ref()))),
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

type MethodFn = dyn Fn(&[ArgValue]) -> CallOutcome + Send + Sync;

/// A target assembled from closures, one per method signature.
#[derive(Default, Clone)]
pub struct MethodTable {
    entries: Vec<(MethodId, Arc<MethodFn>)>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = ParamType>,
        f: F,
    ) -> Self
    where
        F: Fn(&[ArgValue]) -> CallOutcome + Send + Sync + 'static,
    {
        self.entries
            .push((MethodId::new(name, params), Arc::new(f)));
        self
    }
}

impl core::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(m, _)| m.to_string()))
            .finish()
    }
}

impl RetryTarget for MethodTable {
    fn methods(&self) -> Vec<MethodId> {
        self.entries.iter().map(|(m, _)| m.clone()).collect()
    }

    fn invoke(&self, method: &MethodId, args: &[ArgValue]) -> CallOutcome {
        match self.entries.iter().find(|(m, _)| m == method) {
            Some((_, f)) => f(args),
            None => Err(InvocationFailure::new(
                "no_such_method",
                format!("no method {method}"),
            )),
        }
    }
}

/// In-process registry of named targets.
#[derive(Default)]
pub struct TargetRegistry {
    targets: RwLock<HashMap<String, Arc<dyn RetryTarget>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a target under `name`.
    pub fn register(&self, name: impl Into<String>, target: Arc<dyn RetryTarget>) {
        // A poisoned map still holds consistent entries; keep serving it.
        let mut targets = self.targets.write().unwrap_or_else(|p| p.into_inner());
        targets.insert(name.into(), target);
    }

    pub fn with(self, name: impl Into<String>, target: impl RetryTarget + 'static) -> Self {
        self.register(name, Arc::new(target));
        self
    }

    pub fn names(&self) -> Vec<String> {
        let targets = self.targets.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<_> = targets.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ExecutorResolver for TargetRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RetryTarget>> {
        let targets = self.targets.read().unwrap_or_else(|p| p.into_inner());
        targets.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn billing() -> MethodTable {
        MethodTable::new()
            .method("charge", [ParamType::Str, ParamType::Int], |args| {
                Ok(ArgValue::Str(format!(
                    "charged {} {}",
                    args[0].as_str().unwrap_or_default(),
                    args[1].as_int().unwrap_or_default()
                )))
            })
            .method("explode", [], |_| panic!("kaboom"))
    }

    #[test]
    fn resolves_registered_method() {
        let registry = TargetRegistry::new().with("billing", billing());
        let method = MethodId::new("charge", [ParamType::Str, ParamType::Int]);
        let target = resolve_target(&registry, "billing", &method).unwrap();
        let out = target.invoke(&method, &["a".into(), 5i64.into()]).unwrap();
        assert_eq!(out, ArgValue::Str("charged a 5".into()));
    }

    #[test]
    fn signature_change_is_a_resolution_error() {
        let registry = TargetRegistry::new().with("billing", billing());
        let old = MethodId::new("charge", [ParamType::Str]);
        assert!(matches!(
            resolve_target(&registry, "billing", &old),
            Err(RetryError::TargetResolution(_))
        ));
        assert!(matches!(
            resolve_target(&registry, "missing", &old),
            Err(RetryError::TargetResolution(_))
        ));
    }

    #[test]
    fn duplicate_signatures_are_ambiguous() {
        let dup = MethodTable::new()
            .method("ping", [], |_| Ok(ArgValue::Null))
            .method("ping", [], |_| Ok(ArgValue::Null));
        let registry = TargetRegistry::new().with("dup", dup);
        let err = resolve_target(&registry, "dup", &MethodId::new("ping", [])).err().unwrap();
        assert!(err.to_string().contains("2 methods"));
    }

    #[test]
    fn panics_become_failures() {
        let target = billing();
        let out = invoke_guarded(&target, &MethodId::new("explode", []), &[]);
        let failure = out.unwrap_err();
        assert_eq!(failure.kind, "panic");
        assert_eq!(failure.message, "kaboom");
    }

    #[test]
    fn closures_are_resolvers() {
        let shared: Arc<dyn RetryTarget> = Arc::new(billing());
        let resolver = move |name: &str| (name == "billing").then(|| shared.clone());
        assert!(resolver.resolve("billing").is_some());
        assert!(resolver.resolve("other").is_none());
    }
}
