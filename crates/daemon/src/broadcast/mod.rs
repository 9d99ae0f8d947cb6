//! Event broadcasting.
//!
//! The [`EventHub`] owns the subscriber set. Producers never talk to
//! subscribers directly: they are handed an [`EventSink`] and emit typed
//! events into it.

mod heartbeat;
mod hub;
mod subscriber;

use async_trait::async_trait;
use protocol::Event;

pub use heartbeat::spawn_heartbeat;
pub use hub::EventHub;
pub use subscriber::{
    ChannelSubscriber, DeliveryError, Subscriber, SubscriberId, SubscriberStats,
    DEFAULT_SUBSCRIBER_CAPACITY,
};

/// Destination for events produced by a session.
///
/// Emitting never fails from the producer's point of view; delivery
/// problems are the sink's business.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}
