// src/events/bus.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::BoxFuture;
use crate::errors::Result;
use crate::events::Event;

/// Predicate deciding which events a subscription receives.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Publish/subscribe transport for events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>>;

    /// Events published after this call that satisfy `predicate`.
    fn subscribe(&self, predicate: EventPredicate) -> EventSubscription;
}

/// Accept every event.
pub fn any_event() -> EventPredicate {
    Arc::new(|_| true)
}

/// A filtered stream of events from a [`MemoryEventBus`].
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    predicate: EventPredicate,
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription").finish_non_exhaustive()
    }
}

impl EventSubscription {
    pub fn new(rx: broadcast::Receiver<Event>, predicate: EventPredicate) -> Self {
        Self { rx, predicate }
    }

    /// Next matching event; `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus on a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for MemoryEventBus {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            trace!(event_type = %event.event_type, id = %event.id, "publishing event");
            // No subscribers is not an error.
            let _ = self.tx.send(event);
            Ok(())
        })
    }

    fn subscribe(&self, predicate: EventPredicate) -> EventSubscription {
        EventSubscription::new(self.tx.subscribe(), predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_matching_events() {
        let bus = MemoryEventBus::new();
        let mut all = bus.subscribe(any_event());
        let mut only_b = bus.subscribe(Arc::new(|e: &Event| e.event_type == "b"));

        bus.publish(Event::new("a", "/t")).await.unwrap();
        bus.publish(Event::new("b", "/t")).await.unwrap();

        assert_eq!(all.next().await.unwrap().event_type, "a");
        assert_eq!(all.next().await.unwrap().event_type, "b");
        assert_eq!(only_b.next().await.unwrap().event_type, "b");
    }
}
