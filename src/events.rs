//! Typed protocol notifications.
//!
//! State changes publish onto an explicit broadcast channel. When a
//! change happens inside a database transaction the event is parked in a
//! [`PostCommitQueue`] and only delivered after the commit succeeds, so
//! no listener ever observes a notification before its causing state is
//! durable.

use crate::model::OfferExecutionState;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    RegistrationCompleted {
        exchange_uid: String,
        success: bool,
    },
    OfferReceived {
        offer_id: Uuid,
    },
    OfferAccepted {
        offer_id: Uuid,
        counter_offer: bool,
    },
    OfferDeclined {
        offer_id: Uuid,
    },
    ExecutionStateChanged {
        offer_id: Uuid,
        state: OfferExecutionState,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProtocolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.tx.subscribe()
    }

    /// Publish immediately. Lagging or absent receivers are not an error.
    pub fn publish(&self, event: ProtocolEvent) {
        let _ = self.tx.send(event);
    }

    /// Start a deferred-delivery queue for use inside a transaction.
    pub fn deferred(&self) -> PostCommitQueue {
        PostCommitQueue {
            bus: self.clone(),
            pending: Vec::new(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Buffers events during a transaction. `flush()` after a successful
/// commit delivers them in order; dropping the queue without flushing
/// discards them, which is exactly right for a rolled-back transaction.
pub struct PostCommitQueue {
    bus: EventBus,
    pending: Vec<ProtocolEvent>,
}

impl PostCommitQueue {
    pub fn defer(&mut self, event: ProtocolEvent) {
        self.pending.push(event);
    }

    pub fn flush(mut self) {
        for event in self.pending.drain(..) {
            self.bus.publish(event);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deferred_events_wait_for_flush() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let mut queue = bus.deferred();
        queue.defer(ProtocolEvent::OfferReceived {
            offer_id: Uuid::new_v4(),
        });
        assert!(rx.try_recv().is_err());

        queue.flush();
        assert!(matches!(
            rx.try_recv(),
            Ok(ProtocolEvent::OfferReceived { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_queue_discards_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        {
            let mut queue = bus.deferred();
            queue.defer(ProtocolEvent::OfferDeclined {
                offer_id: Uuid::new_v4(),
            });
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn immediate_publish_without_transaction() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ProtocolEvent::RegistrationCompleted {
            exchange_uid: "exch-1".to_string(),
            success: true,
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(ProtocolEvent::RegistrationCompleted { success: true, .. })
        ));
    }
}
