//! Channel-backed subscriptions.
//!
//! `ChannelListener` forwards every event it receives into an `mpsc` channel
//! so another thread can consume the lifecycle stream at its own pace.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event::RetryEvent;
use crate::listener::{ListenerError, RetryListener};

/// Receiving end of a [`ChannelListener`].
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Listener that forwards events into a channel.
#[derive(Debug)]
pub struct ChannelListener {
    name: String,
    // `Sender` is `Send` but only `Sync` on newer toolchains; the mutex keeps
    // the listener shareable either way.
    sender: Mutex<Sender<RetryEvent>>,
}

impl ChannelListener {
    /// Create a listener and the subscription it feeds.
    pub fn pair(name: impl Into<String>) -> (Arc<Self>, Subscription<RetryEvent>) {
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Self {
            name: name.into(),
            sender: Mutex::new(tx),
        });
        (listener, Subscription::new(rx))
    }
}

impl RetryListener for ChannelListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &RetryEvent) -> Result<(), ListenerError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| ListenerError::new("sender lock poisoned"))?;
        sender
            .send(event.clone())
            .map_err(|_| ListenerError::new("subscriber disconnected"))
    }
}
