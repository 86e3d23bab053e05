// SPDX-License-Identifier: MIT
//! Event Bus: a thin wrapper over [`tokio::sync::broadcast`], the same
//! primitive the daemon's `EventBroadcaster` uses for push notifications.
//! Broadcast channels drop from a single shared ring and signal a lagging
//! receiver with `RecvError::Lagged(n)`; this wraps that per-subscriber so a
//! lag is attributed to the subscriber that hit it, surfaced as the
//! `events_dropped` counter spec.md §4.7/§7 requires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::model::{EventType, MessageId};

/// Default per-subscriber buffer; a subscriber more than this many events
/// behind the publisher sees a gap rather than unbounded memory growth.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event_type: EventType,
    pub message_id: Option<MessageId>,
    pub summary: String,
}

pub struct EventBus {
    sender: broadcast::Sender<Arc<BusEvent>>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _rx) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Publish never blocks and never fails loudly — "no subscribers" is a
    /// normal, common state (matches the daemon's `EventBroadcaster::broadcast`).
    pub fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription { receiver: self.sender.subscribe(), events_dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One subscriber's view of the bus. Cloning the `events_dropped` handle lets
/// a diagnostics endpoint read the counter without holding the receiver.
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<BusEvent>>,
    events_dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Await the next event, transparently skipping past a lag gap and
    /// recording how many events were missed.
    pub async fn recv(&mut self) -> Option<Arc<BusEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.events_dropped.fetch_add(missed, Ordering::Relaxed);
                    warn!(missed, "subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(DEFAULT_BUFFER_SIZE);
        bus.publish(BusEvent { event_type: EventType::Received, message_id: None, summary: "test".into() });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(DEFAULT_BUFFER_SIZE);
        let mut sub = bus.subscribe();
        bus.publish(BusEvent { event_type: EventType::Received, message_id: None, summary: "hello".into() });
        let event = sub.recv().await.unwrap();
        assert_eq!(event.summary, "hello");
    }

    #[tokio::test]
    async fn lagging_subscriber_counts_dropped_events() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        for i in 0..20 {
            bus.publish(BusEvent { event_type: EventType::Received, message_id: None, summary: format!("{i}") });
        }
        // Drain — the first recv() call will hit the Lagged error and skip ahead.
        let _ = sub.recv().await;
        assert!(sub.events_dropped() > 0);
    }
}
