//! Broadcast event bus for routing outcomes.
//!
//! Observers (statistics, audit logs, dashboards) subscribe to the bus; the
//! routing path never waits on them.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::{EventMetadata, RoutingEvent};

/// Events buffered per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 1024;

type Envelope = (RoutingEvent, EventMetadata);
type EventFilter = Box<dyn Fn(&RoutingEvent) -> bool + Send + Sync>;

/// Fan-out of `RoutingEvent`s to every live subscription.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event on behalf of `source`.
    ///
    /// Returns `false` when nobody is subscribed; the event is then dropped.
    pub fn publish(&self, event: RoutingEvent, source: impl Into<String>) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to the events `filter` accepts.
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&RoutingEvent) -> bool + Send + Sync + 'static,
    {
        Subscription {
            rx: self.tx.subscribe(),
            filter: Some(Box::new(filter)),
        }
    }

    /// Subscribe to command outcomes only.
    pub fn command_events(&self) -> Subscription {
        self.subscribe_filtered(RoutingEvent::is_command_event)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventBus`] subscription.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    filter: Option<EventFilter>,
}

impl Subscription {
    /// Next accepted event, or `None` once every sender is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok((event, _)) if self.filter.as_ref().is_some_and(|accept| !accept(&event)) => {}
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;
