use std::cell::RefCell;
use std::sync::{Arc, RwLock};

use tracing::info;

use persevere_core::CallOutcome;

use super::{AttemptContext, FilterOutcome, FilterProvider, FilterRegistration, Next};

/// The ordered filter chain.
///
/// The chain is an immutable slice behind an `Arc`. Traversals run on a
/// snapshot; registration builds a new slice and swaps it in, so a chain
/// already in progress never observes a change.
#[derive(Debug)]
pub struct FilterRegistry {
    chain: RwLock<Arc<[FilterRegistration]>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self {
            chain: RwLock::new(Arc::from(Vec::new())),
        }
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate every provider and freeze the result into the chain.
    pub fn discover(providers: &[&dyn FilterProvider]) -> Self {
        let registrations: Vec<_> = providers.iter().flat_map(|p| p.filters()).collect();
        let registry = Self {
            chain: RwLock::new(freeze(registrations)),
        };
        info!(filters = ?registry.names(), "retry filter chain registered");
        registry
    }

    /// Add a filter, replacing any registered under the same name.
    pub fn register(&self, registration: FilterRegistration) {
        // The slot only ever holds a complete chain, so a poisoned lock is
        // still safe to read and replace.
        let mut chain = self.chain.write().unwrap_or_else(|p| p.into_inner());
        let mut next: Vec<_> = chain
            .iter()
            .filter(|r| r.name != registration.name)
            .cloned()
            .collect();
        next.push(registration);
        *chain = freeze(next);
    }

    /// Remove a filter by name. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut chain = self.chain.write().unwrap_or_else(|p| p.into_inner());
        let next: Vec<_> = chain.iter().filter(|r| r.name != name).cloned().collect();
        let removed = next.len() != chain.len();
        *chain = freeze(next);
        removed
    }

    pub fn snapshot(&self) -> Arc<[FilterRegistration]> {
        self.chain.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one attempt through the chain; `terminal` performs the call.
    pub fn execute(
        &self,
        ctx: &AttemptContext<'_>,
        terminal: &dyn Fn() -> CallOutcome,
    ) -> FilterOutcome {
        let chain = self.snapshot();
        let invoked = RefCell::new(None);
        Next::new(&chain, terminal, &invoked).proceed(ctx)
    }
}

/// Stable sort: equal orders keep registration order.
fn freeze(mut registrations: Vec<FilterRegistration>) -> Arc<[FilterRegistration]> {
    registrations.sort_by_key(|r| r.order);
    Arc::from(registrations)
}
