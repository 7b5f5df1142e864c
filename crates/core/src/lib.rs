//! `persevere-core`: the pure half of the retry engine.
//!
//! Everything here is free of IO and threads: the captured invocation and its
//! argument universe, the result-acceptance predicates, the wait/stop
//! strategies, the serializer contracts and the persisted `RetryTask` record.
//! The runtime that drives these lives in `persevere-infra`.

pub mod error;
pub mod id;
pub mod invocation;
pub mod predicate;
pub mod serializer;
pub mod strategy;
pub mod target;
pub mod task;
pub mod value;

pub use error::{RetryError, RetryResult};
pub use id::TaskId;
pub use invocation::{CallOutcome, Invocation, InvocationFailure, MethodId};
pub use predicate::{PredicateRegistry, ResultPredicate, Verdict};
pub use serializer::{
    EncodedBlob, InvocationSerializer, JsonSerializer, PredicateSerializer, TypeRegistry,
};
pub use strategy::{
    BackoffKind, CustomStop, CustomWait, StopPolicy, StopStrategy, WaitPolicy, WaitStrategy,
};
pub use target::{
    ExecutorResolver, MethodTable, RetryTarget, TargetRegistry, invoke_guarded, resolve_target,
};
pub use task::{RetryTask, StrategyOverride, TaskStatus};
pub use value::{ArgValue, CompositeArg, CompositeValue, ParamType};
