//! Retry runtime: configuration, task storage, the filter chain, the retry
//! executor and the scheduling container.

pub mod config;
pub mod container;
pub mod executor;
pub mod filter;
pub mod health;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::{
    CleanupPolicy, ConfigError, DefaultStrategyAccess, RetryConfiguration,
    RetryConfigurationBuilder, RetrySettings, SerializerAccess, StopPolicySettings,
    StrategyAccess, WaitPolicySettings,
};
pub use container::{ContainerHandle, ContainerStats, RetryContainer, StatsSnapshot, TickReport};
pub use executor::{AttemptReport, FirstAttempt, RetryExecutor, RetryOptions, SkipReason};
pub use filter::{
    AttemptContext, CircuitBreakerFilter, FilterError, FilterOutcome, FilterProvider,
    FilterRegistration, FilterRegistry, LoggingFilter, Next, RetryFilter, Veto,
};
pub use health::StorageHealth;
pub use store::{InMemoryTaskStore, TaskStats, TaskStore, TaskStoreError};
