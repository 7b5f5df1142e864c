//! Retry lifecycle events and their fan-out.

pub mod event;
pub mod listener;
pub mod multicaster;
pub mod subscription;

pub use event::{RetryEvent, RetryEventKind};
pub use listener::{FnListener, ListenerError, RetryListener};
pub use multicaster::{EventMulticaster, PublishReport, SimpleEventMulticaster};
pub use subscription::{ChannelListener, Subscription};
