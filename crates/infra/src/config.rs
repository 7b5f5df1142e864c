//! Configuration loading and representation.
//!
//! [`RetrySettings`] is the plain, serde-loadable option surface.
//! [`RetryConfiguration`] bundles settings with the live collaborators the
//! executor and container need. It is built once at startup and shared
//! read-only behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use persevere_core::{
    BackoffKind, ExecutorResolver, InvocationSerializer, JsonSerializer, PredicateRegistry,
    PredicateSerializer, StopPolicy, StopStrategy, StrategyOverride, TypeRegistry, WaitPolicy,
    WaitStrategy,
};
use persevere_events::{EventMulticaster, SimpleEventMulticaster};

use crate::store::TaskStore;

/// Prefix for every environment variable `RetrySettings::from_env` reads.
pub const ENV_PREFIX: &str = "PERSEVERE_";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing required component: {0}")]
    Missing(&'static str),
}

/// What happens to a task once it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CleanupPolicy {
    /// Move it out of the live set, keep it readable
    #[default]
    Archive,
    /// Remove it entirely
    Delete,
}

/// `waitPolicy` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitPolicySettings {
    pub policy: BackoffKind,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for WaitPolicySettings {
    fn default() -> Self {
        Self {
            policy: BackoffKind::Fixed,
            base_ms: 5_000,
            max_ms: 5_000,
        }
    }
}

impl WaitPolicySettings {
    pub fn to_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            self.policy,
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
        )
    }
}

/// `stopPolicy` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StopPolicySettings {
    /// `attempts` falls back to `maxRetryTimes`.
    MaxAttempts {
        #[serde(default)]
        attempts: Option<u32>,
    },
    MaxElapsed {
        #[serde(rename = "maxElapsedMs")]
        max_elapsed_ms: u64,
    },
}

impl Default for StopPolicySettings {
    fn default() -> Self {
        StopPolicySettings::MaxAttempts { attempts: None }
    }
}

/// Recognized options, all with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_retry_times: u32,
    pub wait_policy: WaitPolicySettings,
    pub stop_policy: StopPolicySettings,
    pub tick_interval_ms: u64,
    pub batch_size: usize,
    pub worker_count: usize,
    pub lease_timeout_ms: u64,
    pub cleanup: CleanupPolicy,
    pub storage_retry_attempts: u32,
    pub storage_retry_base_ms: u64,
    pub storage_failure_threshold: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry_times: 5,
            wait_policy: WaitPolicySettings::default(),
            stop_policy: StopPolicySettings::default(),
            tick_interval_ms: 1_000,
            batch_size: 32,
            worker_count: 4,
            lease_timeout_ms: 300_000,
            cleanup: CleanupPolicy::Archive,
            storage_retry_attempts: 3,
            storage_retry_base_ms: 50,
            storage_failure_threshold: 5,
        }
    }
}

impl RetrySettings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overridden by `PERSEVERE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `PERSEVERE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("MAX_RETRY_TIMES") {
            s.max_retry_times = parse("MAX_RETRY_TIMES", &v)?;
        }
        if let Some(v) = get("WAIT_POLICY") {
            s.wait_policy.policy = parse_backoff(&v)?;
        }
        if let Some(v) = get("WAIT_BASE_MS") {
            s.wait_policy.base_ms = parse("WAIT_BASE_MS", &v)?;
        }
        if let Some(v) = get("WAIT_MAX_MS") {
            s.wait_policy.max_ms = parse("WAIT_MAX_MS", &v)?;
        }
        match get("STOP_POLICY").as_deref() {
            None | Some("maxAttempts") => {
                if let Some(v) = get("STOP_MAX_ATTEMPTS") {
                    s.stop_policy = StopPolicySettings::MaxAttempts {
                        attempts: Some(parse("STOP_MAX_ATTEMPTS", &v)?),
                    };
                }
            }
            Some("maxElapsed") => {
                let v = get("STOP_MAX_ELAPSED_MS").ok_or_else(|| {
                    ConfigError::Invalid(format!("{ENV_PREFIX}STOP_MAX_ELAPSED_MS is required"))
                })?;
                s.stop_policy = StopPolicySettings::MaxElapsed {
                    max_elapsed_ms: parse("STOP_MAX_ELAPSED_MS", &v)?,
                };
            }
            Some(other) => return Err(invalid("STOP_POLICY", other)),
        }
        if let Some(v) = get("TICK_INTERVAL_MS") {
            s.tick_interval_ms = parse("TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            s.batch_size = parse("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("WORKER_COUNT") {
            s.worker_count = parse("WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("LEASE_TIMEOUT_MS") {
            s.lease_timeout_ms = parse("LEASE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("CLEANUP") {
            s.cleanup = match v.to_ascii_lowercase().as_str() {
                "archive" => CleanupPolicy::Archive,
                "delete" => CleanupPolicy::Delete,
                _ => return Err(invalid("CLEANUP", &v)),
            };
        }
        if let Some(v) = get("STORAGE_RETRY_ATTEMPTS") {
            s.storage_retry_attempts = parse("STORAGE_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("STORAGE_RETRY_BASE_MS") {
            s.storage_retry_base_ms = parse("STORAGE_RETRY_BASE_MS", &v)?;
        }
        if let Some(v) = get("STORAGE_FAILURE_THRESHOLD") {
            s.storage_failure_threshold = parse("STORAGE_FAILURE_THRESHOLD", &v)?;
        }

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batchSize must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("workerCount must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tickIntervalMs must be positive".into()));
        }
        // Held leases are renewed once per tick.
        if self.lease_timeout_ms <= self.tick_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "leaseTimeoutMs ({}) must exceed tickIntervalMs ({})",
                self.lease_timeout_ms, self.tick_interval_ms
            )));
        }
        if self.wait_policy.max_ms < self.wait_policy.base_ms {
            return Err(ConfigError::Invalid(format!(
                "waitPolicy.maxMs ({}) is below baseMs ({})",
                self.wait_policy.max_ms, self.wait_policy.base_ms
            )));
        }
        if allows_no_attempts(&self.stop_policy()) {
            return Err(ConfigError::Invalid(
                "maxAttempts must allow at least one attempt".into(),
            ));
        }
        Ok(())
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait_policy.to_policy()
    }

    pub fn stop_policy(&self) -> StopPolicy {
        match self.stop_policy {
            StopPolicySettings::MaxAttempts { attempts } => {
                StopPolicy::max_attempts(attempts.unwrap_or(self.max_retry_times))
            }
            StopPolicySettings::MaxElapsed { max_elapsed_ms } => {
                StopPolicy::max_elapsed(Duration::from_millis(max_elapsed_ms))
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn storage_retry_base(&self) -> Duration {
        Duration::from_millis(self.storage_retry_base_ms)
    }
}

fn allows_no_attempts(policy: &StopPolicy) -> bool {
    matches!(
        policy,
        StopPolicy::MaxAttempts { attempts: 0 } | StopPolicy::AttemptsOrElapsed { attempts: 0, .. }
    )
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_backoff(value: &str) -> Result<BackoffKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffKind::Fixed),
        "linear" => Ok(BackoffKind::Linear),
        "exponential" => Ok(BackoffKind::Exponential),
        _ => Err(invalid("WAIT_POLICY", value)),
    }
}

/// Serializers used to persist invocations and predicates.
#[derive(Clone)]
pub struct SerializerAccess {
    pub invocation: Arc<dyn InvocationSerializer>,
    pub predicate: Arc<dyn PredicateSerializer>,
}

impl SerializerAccess {
    /// One JSON serializer for both blobs.
    pub fn json(types: TypeRegistry) -> Self {
        let json = Arc::new(JsonSerializer::new(types));
        Self {
            invocation: json.clone(),
            predicate: json,
        }
    }
}

impl Default for SerializerAccess {
    fn default() -> Self {
        Self::json(TypeRegistry::new())
    }
}

/// Resolves the wait/stop decision for a task, honoring its override.
pub trait StrategyAccess: Send + Sync {
    fn compute_delay(
        &self,
        task_override: &StrategyOverride,
        attempt: u32,
        last_attempt_at: DateTime<Utc>,
    ) -> Duration;

    fn should_stop(&self, task_override: &StrategyOverride, attempt: u32, elapsed: Duration) -> bool;
}

/// Global strategies with per-task policy overrides.
#[derive(Debug, Clone)]
pub struct DefaultStrategyAccess {
    wait: Arc<dyn WaitStrategy>,
    stop: Arc<dyn StopStrategy>,
}

impl DefaultStrategyAccess {
    pub fn new(wait: Arc<dyn WaitStrategy>, stop: Arc<dyn StopStrategy>) -> Self {
        Self { wait, stop }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            Arc::new(settings.wait_policy()),
            Arc::new(settings.stop_policy()),
        )
    }
}

impl StrategyAccess for DefaultStrategyAccess {
    fn compute_delay(
        &self,
        task_override: &StrategyOverride,
        attempt: u32,
        last_attempt_at: DateTime<Utc>,
    ) -> Duration {
        match &task_override.wait {
            Some(policy) => policy.compute_delay(attempt, last_attempt_at),
            None => self.wait.compute_delay(attempt, last_attempt_at),
        }
    }

    fn should_stop(&self, task_override: &StrategyOverride, attempt: u32, elapsed: Duration) -> bool {
        match &task_override.stop {
            Some(policy) => policy.should_stop(attempt, elapsed),
            None => self.stop.should_stop(attempt, elapsed),
        }
    }
}

/// Process-wide retry configuration.
pub struct RetryConfiguration {
    store: Arc<dyn TaskStore>,
    serializers: SerializerAccess,
    strategies: Arc<dyn StrategyAccess>,
    resolver: Arc<dyn ExecutorResolver>,
    predicates: PredicateRegistry,
    multicaster: Arc<dyn EventMulticaster>,
    settings: RetrySettings,
}

impl RetryConfiguration {
    pub fn builder() -> RetryConfigurationBuilder {
        RetryConfigurationBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn serializers(&self) -> &SerializerAccess {
        &self.serializers
    }

    pub fn strategies(&self) -> &dyn StrategyAccess {
        self.strategies.as_ref()
    }

    pub fn resolver(&self) -> &dyn ExecutorResolver {
        self.resolver.as_ref()
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    pub fn multicaster(&self) -> &Arc<dyn EventMulticaster> {
        &self.multicaster
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }
}

impl core::fmt::Debug for RetryConfiguration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryConfiguration")
            .field("settings", &self.settings)
            .field("predicates", &self.predicates)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RetryConfiguration`]. Store and resolver are required.
#[derive(Default)]
pub struct RetryConfigurationBuilder {
    store: Option<Arc<dyn TaskStore>>,
    serializers: Option<SerializerAccess>,
    strategies: Option<Arc<dyn StrategyAccess>>,
    wait: Option<Arc<dyn WaitStrategy>>,
    stop: Option<Arc<dyn StopStrategy>>,
    resolver: Option<Arc<dyn ExecutorResolver>>,
    predicates: PredicateRegistry,
    multicaster: Option<Arc<dyn EventMulticaster>>,
    settings: RetrySettings,
}

impl RetryConfigurationBuilder {
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ExecutorResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn serializers(mut self, serializers: SerializerAccess) -> Self {
        self.serializers = Some(serializers);
        self
    }

    /// Replace strategy resolution entirely.
    pub fn strategies(mut self, strategies: Arc<dyn StrategyAccess>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// Global wait strategy, in place of the one from settings.
    pub fn with_wait_strategy(mut self, wait: impl WaitStrategy + 'static) -> Self {
        self.wait = Some(Arc::new(wait));
        self
    }

    /// Global stop strategy, in place of the one from settings.
    pub fn with_stop_strategy(mut self, stop: impl StopStrategy + 'static) -> Self {
        self.stop = Some(Arc::new(stop));
        self
    }

    pub fn predicates(mut self, predicates: PredicateRegistry) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn multicaster(mut self, multicaster: Arc<dyn EventMulticaster>) -> Self {
        self.multicaster = Some(multicaster);
        self
    }

    pub fn settings(mut self, settings: RetrySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Arc<RetryConfiguration>, ConfigError> {
        self.settings.validate()?;

        let store = self.store.ok_or(ConfigError::Missing("task store"))?;
        let resolver = self.resolver.ok_or(ConfigError::Missing("executor resolver"))?;

        let strategies = match self.strategies {
            Some(strategies) => strategies,
            None => {
                let wait = self
                    .wait
                    .unwrap_or_else(|| Arc::new(self.settings.wait_policy()));
                let stop = self
                    .stop
                    .unwrap_or_else(|| Arc::new(self.settings.stop_policy()));
                Arc::new(DefaultStrategyAccess::new(wait, stop))
            }
        };

        Ok(Arc::new(RetryConfiguration {
            store,
            serializers: self.serializers.unwrap_or_default(),
            strategies,
            resolver,
            predicates: self.predicates,
            multicaster: self
                .multicaster
                .unwrap_or_else(|| Arc::new(SimpleEventMulticaster::new())),
            settings: self.settings,
        }))
    }
}
