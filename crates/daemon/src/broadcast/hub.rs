//! The event hub.
//!
//! Keeps the live subscriber set and fans every broadcast out to it. A
//! broadcast snapshots the set, hands the same reference-counted frame to
//! each member once, and removes the members whose delivery failed after
//! the pass is over. Nothing is buffered for subscribers that join later.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{Event, EventFrame};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::subscriber::{
    ChannelSubscriber, Subscriber, SubscriberId, SubscriberStats, DEFAULT_SUBSCRIBER_CAPACITY,
};
use super::EventSink;

/// Fan-out of event frames to a dynamic set of subscribers.
pub struct EventHub {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    /// Queue depth used by [`EventHub::subscribe_channel`].
    channel_capacity: usize,
}

impl EventHub {
    /// Creates an empty hub with the default channel capacity.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Creates an empty hub whose channel subscribers buffer `capacity` frames.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            channel_capacity: capacity,
        }
    }

    /// Adds a subscriber. Always succeeds.
    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = Uuid::new_v4().to_string();
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id.clone(), subscriber);
        tracing::debug!(
            subscriber_id = %id,
            subscribers = subscribers.len(),
            "Subscriber added"
        );
        id
    }

    /// Adds a [`ChannelSubscriber`] and returns its id and receiving end.
    pub async fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<Arc<EventFrame>>) {
        let (subscriber, rx) = ChannelSubscriber::new(self.channel_capacity);
        let id = self.subscribe(Arc::new(subscriber)).await;
        (id, rx)
    }

    /// Removes a subscriber. Returns whether it was registered.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(id).is_some();
        if removed {
            tracing::debug!(subscriber_id = %id, "Subscriber removed");
        }
        removed
    }

    /// Broadcasts a named event with a JSON payload.
    ///
    /// Returns how many subscribers accepted the frame. Subscribers whose
    /// delivery failed are removed once every member has been tried.
    pub async fn broadcast(&self, event_type: &str, payload: serde_json::Value) -> usize {
        if self.is_empty().await {
            return 0;
        }
        self.broadcast_frame(EventFrame::new(event_type, payload))
            .await
    }

    /// Broadcasts a typed event.
    ///
    /// The payload is only serialized when someone is listening.
    pub async fn publish(&self, event: &Event) -> usize {
        if self.is_empty().await {
            return 0;
        }
        match event.to_frame() {
            Ok(frame) => self.broadcast_frame(frame).await,
            Err(e) => {
                tracing::warn!(
                    event = %event.event_type(),
                    error = %e,
                    "Failed to encode event"
                );
                0
            }
        }
    }

    async fn broadcast_frame(&self, frame: EventFrame) -> usize {
        let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .map(|(id, s)| (id.clone(), Arc::clone(s)))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let frame = Arc::new(frame);
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, subscriber) in targets {
            match subscriber.deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(subscriber_id = %id, error = %e, "Delivery failed");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in failed {
                if subscribers.remove(&id).is_some() {
                    tracing::info!(subscriber_id = %id, "Dropped unreachable subscriber");
                }
            }
        }

        tracing::trace!(event = %frame.event, delivered = delivered, "Broadcast complete");
        delivered
    }

    /// Returns the number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Returns the ids of all live subscribers.
    pub async fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.subscribers.read().await.keys().cloned().collect()
    }

    /// Returns delivery statistics for one subscriber, if it tracks them.
    pub async fn subscriber_stats(&self, id: &str) -> Option<SubscriberStats> {
        self.subscribers.read().await.get(id).and_then(|s| s.stats())
    }

    /// Returns delivery statistics for every subscriber that tracks them.
    pub async fn all_subscriber_stats(&self) -> HashMap<SubscriberId, SubscriberStats> {
        self.subscribers
            .read()
            .await
            .iter()
            .filter_map(|(id, s)| s.stats().map(|stats| (id.clone(), stats)))
            .collect()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventHub {
    async fn emit(&self, event: Event) {
        self.publish(&event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::DeliveryError;
    use protocol::{OutputEvent, StatusPayload};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Counts delivery attempts and optionally fails every one.
    struct CountingSink {
        attempts: AtomicUsize,
        fail: bool,
    }

    impl CountingSink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                fail,
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Subscriber for CountingSink {
        fn deliver(&self, _frame: Arc<EventFrame>) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DeliveryError::Failed("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let hub = EventHub::new();
        let (a, _rx_a) = hub.subscribe_channel().await;
        let (b, _rx_b) = hub.subscribe_channel().await;
        assert_ne!(a, b);
        assert_eq!(hub.subscriber_count().await, 2);

        assert!(hub.unsubscribe(&a).await);
        assert!(!hub.unsubscribe(&a).await);
        assert_eq!(hub.subscriber_ids().await, vec![b]);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_subscribers_is_noop() {
        let hub = EventHub::new();
        for _ in 0..5 {
            assert_eq!(hub.broadcast("heartbeat", json!({})).await, 0);
            assert_eq!(hub.publish(&Event::command_sent("ls")).await, 0);
        }

        // Nothing is replayed to a subscriber that joins afterwards.
        let (_id, mut rx) = hub.subscribe_channel().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(hub.subscribe_channel().await.1);
        }

        let delivered = hub
            .publish(&Event::Status(StatusPayload::Running { pid: Some(9) }))
            .await;
        assert_eq!(delivered, 3);

        for rx in &mut receivers {
            let frame = timeout(Duration::from_millis(100), rx.recv())
                .await
                .expect("timeout")
                .expect("closed");
            assert_eq!(frame.event, "claude_status");
            assert_eq!(frame.data, json!({"status": "running", "pid": 9}));
        }
    }

    #[tokio::test]
    async fn test_failed_subscribers_removed_after_pass() {
        let hub = EventHub::new();
        let healthy: Vec<_> = (0..3).map(|_| CountingSink::new(false)).collect();
        let broken: Vec<_> = (0..2).map(|_| CountingSink::new(true)).collect();

        let mut broken_ids = Vec::new();
        for sink in &healthy {
            hub.subscribe(sink.clone()).await;
        }
        for sink in &broken {
            broken_ids.push(hub.subscribe(sink.clone()).await);
        }

        let delivered = hub.broadcast("claude_output", json!({"content": "x"})).await;
        assert_eq!(delivered, 3);
        assert_eq!(hub.subscriber_count().await, 3);

        // Exactly one attempt per subscriber.
        for sink in healthy.iter().chain(broken.iter()) {
            assert_eq!(sink.attempts(), 1);
        }
        let ids = hub.subscriber_ids().await;
        for id in &broken_ids {
            assert!(!ids.contains(id));
        }

        // Removed subscribers are not tried again.
        hub.broadcast("claude_output", json!({"content": "y"})).await;
        for sink in &broken {
            assert_eq!(sink.attempts(), 1);
        }
        for sink in &healthy {
            assert_eq!(sink.attempts(), 2);
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_removed() {
        let hub = EventHub::new();
        let (stays, _rx_stays) = hub.subscribe_channel().await;
        let (_gone, rx_gone) = hub.subscribe_channel().await;
        drop(rx_gone);

        assert_eq!(hub.publish(&OutputEvent::text("hi").into()).await, 1);
        assert_eq!(hub.subscriber_ids().await, vec![stays]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_stall_others() {
        let hub = EventHub::with_channel_capacity(2);
        let (slow, _rx_slow) = hub.subscribe_channel().await;
        let (fast, mut rx_fast) = hub.subscribe_channel().await;

        for i in 0..10 {
            hub.broadcast("claude_output", json!({ "n": i })).await;
            let frame = rx_fast.recv().await.unwrap();
            assert_eq!(frame.data["n"], i);
        }

        let slow_stats = hub.subscriber_stats(&slow).await.unwrap();
        assert_eq!(slow_stats.messages_sent, 2);
        assert_eq!(slow_stats.messages_dropped, 8);
        assert!(slow_stats.is_backpressured);

        let fast_stats = hub.subscriber_stats(&fast).await.unwrap();
        assert_eq!(fast_stats.messages_sent, 10);
        assert_eq!(fast_stats.messages_dropped, 0);

        // Backpressured subscribers are kept.
        assert_eq!(hub.subscriber_count().await, 2);
        assert_eq!(hub.all_subscriber_stats().await.len(), 2);
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscriber() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.subscribe_channel().await;

        for i in 0..20 {
            hub.publish(&OutputEvent::text(format!("chunk-{i:02}")).into())
                .await;
        }
        for i in 0..20 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.data["content"], format!("chunk-{i:02}"));
        }
    }

    #[tokio::test]
    async fn test_hub_as_event_sink() {
        let hub = Arc::new(EventHub::new());
        let (_id, mut rx) = hub.subscribe_channel().await;

        let sink: Arc<dyn EventSink> = hub.clone();
        sink.emit(Event::command_sent("hello")).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "command_sent");
        assert_eq!(frame.data["command"], "hello");
    }
}
