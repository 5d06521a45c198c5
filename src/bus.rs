//! Fan-out of live-channel updates to independent consumers.
//!
//! Each subscriber owns an unbounded queue, so a slow consumer never causes
//! another to miss an update and nothing is dropped while the socket is
//! open. Updates are delivered to every queue in publish order.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::events::LiveUpdate;

/// Shared publisher side. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<LiveUpdate>>>>,
}

/// Receiving side handed to a consumer (message pane, conversation list...).
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<LiveUpdate>,
}

impl Subscription {
    /// Wait for the next update. `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<LiveUpdate> {
        self.rx.recv().await
    }

    /// Non-blocking variant for draining in tests and UIs.
    pub fn try_recv(&mut self) -> Option<LiveUpdate> {
        self.rx.try_recv().ok()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer. It only sees updates published afterwards.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(tx);
        Subscription { rx }
    }

    /// Deliver `update` to every live subscriber, pruning closed ones.
    /// Returns how many subscribers received it.
    pub fn publish(&self, update: LiveUpdate) -> usize {
        let mut guard = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        guard.retain(|tx| tx.send(update.clone()).is_ok());
        guard.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|g| g.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
