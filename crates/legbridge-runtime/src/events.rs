//! Session event channel.
//!
//! Lifecycle transitions, watchdog stops, keepalive failures and e-stops are
//! published on a [`tokio::sync::broadcast`] channel so any number of
//! observers (the operator console, a status page, tests) see every event
//! without being able to slow the session down.  A subscriber that falls
//! behind loses the oldest events.

use legbridge_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 128;

/// Source label attached to every event published by a session.
pub const SESSION_SOURCE: &str = "legbridge-runtime::session";

/// Cheap to clone; clones share one channel.
#[derive(Clone, Debug)]
pub struct EventChannel {
    sender: broadcast::Sender<Event>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish `payload`.  Returns the number of subscribers that received
    /// it; having none is normal.
    pub fn publish(&self, payload: EventPayload) -> usize {
        let event = Event::new(SESSION_SOURCE, payload);
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(payload = ?event.payload, "No event subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legbridge_types::{LifecycleState, WatchdogReason};

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let events = EventChannel::default();
        assert_eq!(
            events.publish(EventPayload::WatchdogStop {
                reason: WatchdogReason::CommandExpired
            }),
            0
        );
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let events = EventChannel::default();
        let mut a = events.subscribe();
        let mut b = events.clone().subscribe();

        let payload = EventPayload::LifecycleChanged {
            from: LifecycleState::Acquiring,
            to: LifecycleState::Active,
        };
        assert_eq!(events.publish(payload.clone()), 2);

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.payload, payload);
            assert_eq!(event.source, SESSION_SOURCE);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let events = EventChannel::new(2);
        let mut rx = events.subscribe();
        for _ in 0..5 {
            events.publish(EventPayload::EmergencyStop {
                source: "test".into(),
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
