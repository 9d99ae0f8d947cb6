//! Subscriber sinks.
//!
//! The hub only knows that a subscriber can be handed a frame and that the
//! hand-off can fail. [`ChannelSubscriber`] is the stock implementation: a
//! bounded queue drained by whoever owns the receiving end (an IPC
//! connection, a test, an SSE bridge).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use protocol::EventFrame;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque subscriber identity returned by [`EventHub::subscribe`](super::EventHub::subscribe).
pub type SubscriberId = String;

/// Default queue depth for channel subscribers.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Reasons a frame could not be handed to a subscriber.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The receiving side is gone.
    #[error("subscriber closed")]
    Closed,

    /// Any other sink-specific failure.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Delivery statistics for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Frames accepted by the sink.
    pub messages_sent: u64,
    /// Frames dropped because the sink was full.
    pub messages_dropped: u64,
    /// Whether the last delivery found the sink full.
    pub is_backpressured: bool,
}

/// A sink the hub writes frames to.
///
/// `deliver` is called from inside a broadcast pass and must not block:
/// implementations hand the frame off and return. Any error makes the hub
/// drop the subscriber after the pass.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, frame: Arc<EventFrame>) -> Result<(), DeliveryError>;

    /// Delivery statistics, for sinks that track them.
    fn stats(&self) -> Option<SubscriberStats> {
        None
    }
}

/// Subscriber backed by a bounded tokio channel.
///
/// A full queue drops the frame for this subscriber only and sets the
/// backpressure flag; the subscriber stays registered. A closed queue is a
/// delivery failure.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Arc<EventFrame>>,
    sent: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ChannelSubscriber {
    /// Creates a subscriber and the receiver its frames arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<EventFrame>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = ChannelSubscriber {
            tx,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        };
        (subscriber, rx)
    }

    /// Returns whether the last delivery found the queue full.
    pub fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Relaxed)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, frame: Arc<EventFrame>) -> Result<(), DeliveryError> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!("Subscriber recovered from backpressure");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(dropped = dropped, "Subscriber is backpressured, dropping events");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    fn stats(&self) -> Option<SubscriberStats> {
        Some(SubscriberStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        })
    }
}
