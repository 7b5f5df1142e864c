//! Synchronous, failure-isolating event fan-out.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::event::RetryEvent;
use crate::listener::RetryListener;

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Publishes lifecycle events to registered listeners.
///
/// Listeners are notified in registration order on the publishing thread. A
/// listener that errors or panics is reported and skipped; the remaining
/// listeners are still notified.
pub trait EventMulticaster: Send + Sync {
    fn register(&self, listener: Arc<dyn RetryListener>);

    fn publish(&self, event: &RetryEvent) -> PublishReport;
}

impl<M> EventMulticaster for Arc<M>
where
    M: EventMulticaster + ?Sized,
{
    fn register(&self, listener: Arc<dyn RetryListener>) {
        (**self).register(listener)
    }

    fn publish(&self, event: &RetryEvent) -> PublishReport {
        (**self).publish(event)
    }
}

/// Default multicaster.
#[derive(Default)]
pub struct SimpleEventMulticaster {
    listeners: RwLock<Vec<Arc<dyn RetryListener>>>,
}

impl SimpleEventMulticaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<Arc<dyn RetryListener>> {
        // Listeners are only ever appended, so a poisoned list is still usable.
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl EventMulticaster for SimpleEventMulticaster {
    fn register(&self, listener: Arc<dyn RetryListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        listeners.push(listener);
    }

    fn publish(&self, event: &RetryEvent) -> PublishReport {
        let mut report = PublishReport::default();

        // Notify outside the lock so listeners may register others.
        for listener in self.snapshot() {
            if !listener.accepts(event.kind) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        listener = listener.name(),
                        event = %event.kind,
                        task_id = %event.task_id,
                        error = %err,
                        "retry listener failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        listener = listener.name(),
                        event = %event.kind,
                        task_id = %event.task_id,
                        "retry listener panicked"
                    );
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use persevere_core::TaskId;

    use super::*;
    use crate::event::RetryEventKind;
    use crate::listener::{FnListener, ListenerError};

    fn event(kind: RetryEventKind) -> RetryEvent {
        RetryEvent::new(kind, TaskId::new(), "billing", "charge()", 1)
    }

    #[test]
    fn notifies_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let m = SimpleEventMulticaster::new();
        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            m.register(Arc::new(FnListener::new(name, move |_| {
                seen.lock().unwrap().push(name);
                Ok(())
            })));
        }

        let report = m.publish(&event(RetryEventKind::AttemptStarted));
        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_listeners_do_not_stop_the_rest() {
        let seen = Arc::new(Mutex::new(0));
        let m = SimpleEventMulticaster::new();
        m.register(Arc::new(FnListener::new("errs", |_| Err(ListenerError::new("nope")))));
        m.register(Arc::new(FnListener::new("panics", |_| panic!("listener bug"))));
        let counter = seen.clone();
        m.register(Arc::new(FnListener::new("counts", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        })));

        let report = m.publish(&event(RetryEventKind::TaskExhausted));
        assert_eq!(report, PublishReport { delivered: 1, failed: 2 });
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn listeners_can_filter_kinds() {
        struct OnlyExhausted(Mutex<usize>);

        impl RetryListener for OnlyExhausted {
            fn accepts(&self, kind: RetryEventKind) -> bool {
                kind == RetryEventKind::TaskExhausted
            }

            fn on_event(&self, _event: &RetryEvent) -> Result<(), ListenerError> {
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
        }

        let listener = Arc::new(OnlyExhausted(Mutex::new(0)));
        let m = SimpleEventMulticaster::new();
        m.register(listener.clone());

        m.publish(&event(RetryEventKind::AttemptStarted));
        m.publish(&event(RetryEventKind::TaskExhausted));
        assert_eq!(*listener.0.lock().unwrap(), 1);
    }
}
