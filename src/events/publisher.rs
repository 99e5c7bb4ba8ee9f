//! Broadcast publisher for engine events.
//!
//! Thin wrapper over `tokio::sync::broadcast`. Slow subscribers that fall
//! behind the channel capacity miss the oldest events (standard broadcast
//! lag semantics); the engine never blocks on observers.

use tokio::sync::broadcast;
use tracing::trace;

use super::EngineEvent;

#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers. With no subscribers
    /// the event is dropped silently.
    pub fn publish(&self, event: EngineEvent) {
        trace!(run_id = %event.run_id(), step = ?event.step(), "publishing engine event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event() -> EngineEvent {
        EngineEvent::StepStarted {
            run_id: Uuid::new_v4(),
            step: "build".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let publisher = EventPublisher::new(8);
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(event());
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        let sent = event();
        publisher.publish(sent.clone());
        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event() {
        let publisher = EventPublisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        publisher.publish(event());
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
