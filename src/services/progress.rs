//! Fan-out of task progress to any number of subscribers.
//!
//! Delivery is at-most-once with no replay: a subscriber only sees events
//! published after it subscribed, and a subscriber that falls more than the
//! channel capacity behind skips the overwritten events (logged as lag).
//! Publishing never waits on subscribers.

use crate::models::ProgressEvent;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Returns how many subscribers it was handed to.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        tracing::debug!(
            "progress {} {:?} {:.1} {}",
            event.identifier,
            event.status,
            event.progress,
            event.message
        );
        // No receivers is not an error; the event is simply dropped.
        self.tx.send(event).unwrap_or(0)
    }

    /// Live events for one identifier, in publication order.
    ///
    /// The subscription is registered before this returns, so every event
    /// published afterwards is observed. The stream ends only when the
    /// broadcaster is dropped.
    pub fn subscribe(&self, identifier: &str) -> BoxStream<'static, ProgressEvent> {
        let mut rx = self.tx.subscribe();
        let identifier = identifier.to_string();

        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.identifier == identifier => yield event,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "progress subscriber for '{}' lagged, {} events skipped",
                            identifier,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(stream: &mut BoxStream<'static, ProgressEvent>) -> ProgressEvent {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_its_identifier() {
        let broadcaster = ProgressBroadcaster::new(16);
        let mut a = broadcaster.subscribe("A");

        broadcaster.publish(ProgressEvent::processing("B", "b.txt", 10.0, "b"));
        broadcaster.publish(ProgressEvent::processing("A", "a.txt", 20.0, "a"));
        broadcaster.publish(ProgressEvent::processing("B", "b.txt", 30.0, "b"));
        broadcaster.publish(ProgressEvent::completed("A", "a.txt"));

        let first = next(&mut a).await;
        assert_eq!(first.identifier, "A");
        assert_eq!(first.progress, 20.0);
        let second = next(&mut a).await;
        assert_eq!(second.identifier, "A");
        assert!(second.is_terminal());
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let broadcaster = ProgressBroadcaster::new(16);
        let mut s1 = broadcaster.subscribe("A");
        let mut s2 = broadcaster.subscribe("A");
        assert_eq!(broadcaster.subscriber_count(), 2);

        assert_eq!(
            broadcaster.publish(ProgressEvent::processing("A", "a.txt", 40.0, "x")),
            2
        );
        assert_eq!(next(&mut s1).await.progress, 40.0);
        assert_eq!(next(&mut s2).await.progress, 40.0);

        drop(s1);
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let broadcaster = ProgressBroadcaster::new(2);
        for i in 0..100 {
            assert_eq!(
                broadcaster.publish(ProgressEvent::processing("A", "a.txt", i as f64, "x")),
                0
            );
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_but_continues() {
        let broadcaster = ProgressBroadcaster::new(2);
        let mut slow = broadcaster.subscribe("A");
        for i in 0..10 {
            broadcaster.publish(ProgressEvent::processing("A", "a.txt", i as f64, "x"));
        }
        // Only the newest events survive in the ring
        assert_eq!(next(&mut slow).await.progress, 8.0);
        assert_eq!(next(&mut slow).await.progress, 9.0);
    }
}
