use tracing::trace;

use crate::types::CoordinatorEvent;

/// Coordinator-wide broadcast of [`CoordinatorEvent`]s.
///
/// Every subscriber sees every event published after it subscribed. Slow
/// subscribers lag and lose the oldest events rather than blocking sessions.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<CoordinatorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoordinatorEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
