//! Periodic liveness events.

use std::sync::Arc;
use std::time::Duration;

use protocol::{Event, Heartbeat};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::EventHub;

/// Spawns the heartbeat task.
///
/// Every `interval` a `heartbeat` event is broadcast, but only while the hub
/// has subscribers. The task exits when `cancel` fires.
pub fn spawn_heartbeat(
    hub: Arc<EventHub>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if hub.subscriber_count().await == 0 {
                        continue;
                    }
                    let delivered = hub.publish(&Event::Heartbeat(Heartbeat::now())).await;
                    tracing::trace!(delivered = delivered, "Heartbeat sent");
                }
            }
        }

        tracing::debug!("Heartbeat task stopped");
    })
}
