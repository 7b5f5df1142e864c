//! Demo process: captures one flaky call and lets the container replay it.
//!
//! Settings come from `PERSEVERE_CONFIG` (a JSON file) when set, otherwise
//! from `PERSEVERE_*` environment variables. `PERSEVERE_DEMO_FAILURES`
//! controls how many times the demo target fails before succeeding.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;

use persevere_core::{
    ArgValue, Invocation, InvocationFailure, MethodId, MethodTable, ParamType, TargetRegistry,
};
use persevere_events::{
    ChannelListener, EventMulticaster, FnListener, RetryEventKind, SimpleEventMulticaster,
};
use persevere_infra::{
    CircuitBreakerFilter, FilterRegistration, FilterRegistry, FirstAttempt, InMemoryTaskStore,
    LoggingFilter, RetryConfiguration, RetryContainer, RetryExecutor, RetryOptions, RetrySettings,
};

fn load_settings() -> anyhow::Result<RetrySettings> {
    match std::env::var("PERSEVERE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading retry settings from {path}"))?;
            RetrySettings::from_json(&raw).with_context(|| format!("parsing {path}"))
        }
        Err(_) => RetrySettings::from_env().context("reading PERSEVERE_* settings"),
    }
}

/// `payments.charge(str, int)`, failing `failures` times before it succeeds.
fn payments(failures: u32) -> MethodTable {
    let calls = Arc::new(AtomicU32::new(0));
    MethodTable::new().method("charge", [ParamType::Str, ParamType::Int], move |args| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            return Err(InvocationFailure::new(
                "unavailable",
                format!("gateway unavailable (call {n})"),
            ));
        }
        Ok(ArgValue::Str(format!(
            "charged {} cents to {}",
            args[1].as_int().unwrap_or_default(),
            args[0].as_str().unwrap_or_default()
        )))
    })
}

fn main() -> anyhow::Result<()> {
    persevere_observability::init();

    let settings = load_settings()?;
    let failures = std::env::var("PERSEVERE_DEMO_FAILURES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            tracing::warn!("PERSEVERE_DEMO_FAILURES not set; defaulting to 2");
            2
        });

    let targets = Arc::new(TargetRegistry::new().with("payments", payments(failures)));

    let multicaster = Arc::new(SimpleEventMulticaster::new());
    multicaster.register(Arc::new(FnListener::new("audit", |event| {
        tracing::info!(
            event = %event.kind,
            task_id = %event.task_id,
            attempt = event.attempt,
            error = event.error.as_deref().unwrap_or(""),
            "retry lifecycle event"
        );
        Ok(())
    })));
    let (listener, events) = ChannelListener::pair("runner");
    multicaster.register(listener);

    let builtin: Vec<FilterRegistration> = vec![
        LoggingFilter::registration(0),
        CircuitBreakerFilter::new(5, Duration::from_secs(30)).registration(10),
    ];
    let filters = Arc::new(FilterRegistry::discover(&[&builtin]));

    let config = RetryConfiguration::builder()
        .store(InMemoryTaskStore::arc())
        .resolver(targets)
        .multicaster(multicaster)
        .settings(settings.clone())
        .build()
        .context("building retry configuration")?;
    let executor = Arc::new(RetryExecutor::new(config, filters));
    let container = RetryContainer::new(executor.clone());
    let handle = container.start().context("starting retry container")?;

    let invocation = Invocation::new(
        "payments",
        MethodId::new("charge", [ParamType::Str, ParamType::Int]),
        vec!["acct-42".into(), 1_250i64.into()],
    )?;
    let first = executor.execute(&invocation, RetryOptions::new().with_biz_id("order-42"))?;
    tracing::info!(outcome = ?first, "original call returned");

    if let FirstAttempt::Scheduled { task_id, .. } = first {
        let budget = settings
            .wait_policy()
            .max
            .saturating_mul(settings.max_retry_times.max(1))
            .saturating_add(settings.tick_interval().saturating_mul(4));
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            let Ok(event) = events.recv_timeout(Duration::from_millis(200)) else {
                continue;
            };
            if event.task_id == task_id
                && matches!(
                    event.kind,
                    RetryEventKind::AttemptSucceeded | RetryEventKind::TaskExhausted
                )
            {
                tracing::info!(task_id = %task_id, event = %event.kind, "retry task finished");
                break;
            }
        }
    }

    let stats = handle.stats();
    tracing::info!(
        stats = %serde_json::to_string(&stats)?,
        healthy = handle.is_healthy(),
        at = %chrono::Utc::now(),
        "retry container summary"
    );
    handle.stop();
    Ok(())
}
