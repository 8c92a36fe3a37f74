//! In-process publish/subscribe for bucket status transitions.
//!
//! A thin wrapper over `tokio::sync::broadcast`, the same substrate the
//! source used for its digest worker's wake-up channel, generalised here
//! into a typed event so the EDI Generator and Delivery Engine can each
//! subscribe independently from `main`.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::BucketStatus;

#[derive(Debug, Clone)]
pub struct BucketStatusChangeEvent {
    pub bucket_id: Uuid,
    pub previous_status: BucketStatus,
    pub new_status: BucketStatus,
    pub occurred_at: DateTime<Utc>,
}

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<BucketStatusChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: BucketStatusChangeEvent) {
        // A lagging or absent subscriber must never block bucket mutation.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BucketStatusChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_reach_subscribers() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(BucketStatusChangeEvent {
            bucket_id: Uuid::new_v4(),
            previous_status: BucketStatus::Accumulating,
            new_status: BucketStatus::PendingApproval,
            occurred_at: Utc::now(),
        });

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.new_status, BucketStatus::PendingApproval);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(BucketStatusChangeEvent {
            bucket_id: Uuid::new_v4(),
            previous_status: BucketStatus::Accumulating,
            new_status: BucketStatus::Completed,
            occurred_at: Utc::now(),
        });
    }
}
