//! Process-level storage health signal.
//!
//! Storage failures never fail a task. They are counted here instead, and a
//! run of `threshold` consecutive failures flips the process to unhealthy
//! until the next successful store operation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{error, info, warn};

#[derive(Debug)]
pub struct StorageHealth {
    threshold: u32,
    consecutive_failures: AtomicU32,
    escalated: AtomicBool,
}

impl StorageHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            escalated: AtomicBool::new(false),
        }
    }

    pub fn record_failure(&self, operation: &str, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(operation, failures, error, "task store operation failed");

        if failures >= self.threshold && !self.escalated.swap(true, Ordering::SeqCst) {
            error!(
                operation,
                failures,
                threshold = self.threshold,
                "task store unhealthy: consecutive failure threshold reached"
            );
        }
    }

    pub fn record_success(&self) {
        if self.consecutive_failures.swap(0, Ordering::SeqCst) > 0
            && self.escalated.swap(false, Ordering::SeqCst)
        {
            info!("task store recovered");
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) < self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

impl Default for StorageHealth {
    fn default() -> Self {
        Self::new(5)
    }
}
