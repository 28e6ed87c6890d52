// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over a tokio broadcast channel. Feeds the SSE
// endpoint and doubles as the operator notification sink.
//
// Events are not persisted; a subscriber only sees what is published after it
// subscribed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::domain::events::ServiceEvent;
use crate::domain::notification::{Notification, Notifier, Severity};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
    Service(ServiceEvent),
    Notification(Notification),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before slow subscribers lag
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_service_event(&self, event: ServiceEvent) {
        self.publish(DomainEvent::Service(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Raw receiver, for adapters such as `tokio_stream::wrappers::BroadcastStream`
    pub fn subscribe_raw(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Notifier for EventBus {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Info => info!(source = %notification.source, "{}", notification.message),
            Severity::Warning => warn!(source = %notification.source, "{}", notification.message),
            Severity::Critical => error!(source = %notification.source, "{}", notification.message),
        }
        self.publish(DomainEvent::Notification(notification));
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,
    #[error("Receiver lagged by {0} events")]
    Lagged(u64),
    #[error("No event available")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::{ServiceName, ServiceVersion};
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::with_default_capacity();
        let mut receiver = bus.subscribe();

        bus.publish_service_event(ServiceEvent::MainAssigned {
            name: ServiceName::parse("svc").unwrap(),
            version: ServiceVersion::parse("1.0.0").unwrap(),
            assigned_at: Utc::now(),
        });

        match receiver.recv().await.expect("event") {
            DomainEvent::Service(ServiceEvent::MainAssigned { name, .. }) => {
                assert_eq!(name.as_str(), "svc")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        bus.notify(Notification::manager("drift detected", Severity::Warning));

        match receiver.try_recv().expect("notification") {
            DomainEvent::Notification(n) => {
                assert_eq!(n.message, "drift detected");
                assert_eq!(n.severity, Severity::Warning);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.notify(Notification::manager("nobody listens", Severity::Info));
    }
}
