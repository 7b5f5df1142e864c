//! Shared fixtures for the runtime tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};

use persevere_core::{
    ArgValue, BackoffKind, Invocation, InvocationFailure, MethodId, MethodTable, ParamType,
    PredicateRegistry, TargetRegistry,
};
use persevere_events::{
    ChannelListener, EventMulticaster, RetryEvent, RetryEventKind, SimpleEventMulticaster,
    Subscription,
};

use crate::config::{RetryConfiguration, RetrySettings, WaitPolicySettings};
use crate::container::RetryContainer;
use crate::executor::RetryExecutor;
use crate::filter::FilterRegistry;
use crate::store::TaskStore;

/// FIXED(1s), maxAttempts(3), no storage retry delay.
pub(crate) fn settings() -> RetrySettings {
    RetrySettings {
        max_retry_times: 3,
        wait_policy: WaitPolicySettings {
            policy: BackoffKind::Fixed,
            base_ms: 1_000,
            max_ms: 1_000,
        },
        storage_retry_attempts: 1,
        storage_retry_base_ms: 1,
        ..RetrySettings::default()
    }
}

pub(crate) fn charge_method() -> MethodId {
    MethodId::new("charge", [ParamType::Str, ParamType::Int])
}

pub(crate) fn charge() -> Invocation {
    Invocation::new(
        "billing",
        charge_method(),
        vec!["acct-1".into(), 300i64.into()],
    )
    .unwrap()
}

/// `charge` fails with kind `io` for the first `fail_times` calls.
pub(crate) fn flaky(fail_times: u32, calls: Arc<AtomicU32>) -> MethodTable {
    MethodTable::new().method("charge", [ParamType::Str, ParamType::Int], move |args| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_times {
            Err(InvocationFailure::new("io", format!("call {n} failed")))
        } else {
            Ok(ArgValue::Str(format!(
                "charged {}",
                args[0].as_str().unwrap_or_default()
            )))
        }
    })
}

pub(crate) fn in_future(secs: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(secs)
}

pub(crate) struct Harness {
    pub container: RetryContainer,
    pub targets: Arc<TargetRegistry>,
    pub events: Subscription<RetryEvent>,
    pub calls: Arc<AtomicU32>,
}

impl Harness {
    pub fn executor(&self) -> &Arc<RetryExecutor> {
        self.container.executor()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn event_kinds(&self) -> Vec<RetryEventKind> {
        self.events.drain().into_iter().map(|e| e.kind).collect()
    }
}

/// Container over `store` with a `billing` target that fails `fail_times`
/// times before succeeding.
pub(crate) fn harness(
    store: Arc<dyn TaskStore>,
    settings: RetrySettings,
    filters: FilterRegistry,
    fail_times: u32,
) -> Harness {
    harness_with_predicates(store, settings, filters, fail_times, PredicateRegistry::new())
}

pub(crate) fn harness_with_predicates(
    store: Arc<dyn TaskStore>,
    settings: RetrySettings,
    filters: FilterRegistry,
    fail_times: u32,
    predicates: PredicateRegistry,
) -> Harness {
    let calls = Arc::new(AtomicU32::new(0));
    let targets = Arc::new(TargetRegistry::new());
    targets.register("billing", Arc::new(flaky(fail_times, calls.clone())));

    let multicaster = Arc::new(SimpleEventMulticaster::new());
    let (listener, events) = ChannelListener::pair("test");
    multicaster.register(listener);

    let config = RetryConfiguration::builder()
        .store(store)
        .resolver(targets.clone())
        .multicaster(multicaster)
        .predicates(predicates)
        .settings(settings)
        .build()
        .unwrap();
    let executor = Arc::new(RetryExecutor::new(config, Arc::new(filters)));

    Harness {
        container: RetryContainer::new(executor),
        targets,
        events,
        calls,
    }
}
