use crate::protocol::RealtimeEvent;
use crate::SyncResult;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Best-effort fan-out of commit events to subscribers, possibly across
/// server instances. Advisory only: correctness always comes from pull, so
/// a dropped or duplicated event is never a correctness bug.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, partition_id: &str, event: RealtimeEvent) -> SyncResult<()>;

    /// Subscribes to events for a partition; the returned receiver may lag
    /// and drop events under slow consumption, which is acceptable for an
    /// advisory channel.
    fn subscribe(&self, partition_id: &str) -> broadcast::Receiver<RealtimeEvent>;

    async fn close(&self);
}

/// Default in-process implementation: one `tokio::sync::broadcast` channel
/// per partition, created lazily on first publish or subscribe.
pub struct InProcessBroadcaster {
    channels: dashmap::DashMap<String, broadcast::Sender<RealtimeEvent>>,
    capacity: usize,
}

impl InProcessBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self { channels: dashmap::DashMap::new(), capacity }
    }

    fn sender_for(&self, partition_id: &str) -> broadcast::Sender<RealtimeEvent> {
        self.channels
            .entry(partition_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InProcessBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Broadcaster for InProcessBroadcaster {
    async fn publish(&self, partition_id: &str, event: RealtimeEvent) -> SyncResult<()> {
        // No receivers is not an error: the channel is advisory.
        let _ = self.sender_for(partition_id).send(event);
        Ok(())
    }

    fn subscribe(&self, partition_id: &str) -> broadcast::Receiver<RealtimeEvent> {
        self.sender_for(partition_id).subscribe()
    }

    async fn close(&self) {
        self.channels.clear();
    }
}

/// Suppresses a realtime event whose `source_instance_id` matches the
/// subscriber's own instance, preventing a client from reacting to the
/// echo of its own write.
pub fn should_suppress_echo(event: &RealtimeEvent, own_instance_id: uuid::Uuid) -> bool {
    match event {
        RealtimeEvent::Commit { source_instance_id: Some(source), .. } => *source == own_instance_id,
        RealtimeEvent::Commit { source_instance_id: None, .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let broadcaster = InProcessBroadcaster::default();
        let result = broadcaster
            .publish("tenant-a", RealtimeEvent::Commit {
                commit_seq: 1,
                partition_id: Some("tenant-a".to_string()),
                scope_keys: vec![],
                source_instance_id: None,
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = InProcessBroadcaster::default();
        let mut receiver = broadcaster.subscribe("tenant-a");
        broadcaster
            .publish("tenant-a", RealtimeEvent::Commit {
                commit_seq: 7,
                partition_id: Some("tenant-a".to_string()),
                scope_keys: vec![],
                source_instance_id: None,
            })
            .await
            .unwrap();

        let event = receiver.recv().await.unwrap();
        match event {
            RealtimeEvent::Commit { commit_seq, .. } => assert_eq!(commit_seq, 7),
        }
    }

    #[tokio::test]
    async fn partitions_do_not_cross_talk() {
        let broadcaster = InProcessBroadcaster::default();
        let mut receiver_b = broadcaster.subscribe("tenant-b");
        broadcaster
            .publish("tenant-a", RealtimeEvent::Commit {
                commit_seq: 1,
                partition_id: Some("tenant-a".to_string()),
                scope_keys: vec![],
                source_instance_id: None,
            })
            .await
            .unwrap();

        assert!(receiver_b.try_recv().is_err());
    }

    #[test]
    fn echo_suppressed_when_source_matches() {
        let id = uuid::Uuid::new_v4();
        let event = RealtimeEvent::Commit {
            commit_seq: 1,
            partition_id: None,
            scope_keys: vec![],
            source_instance_id: Some(id),
        };
        assert!(should_suppress_echo(&event, id));
        assert!(!should_suppress_echo(&event, uuid::Uuid::new_v4()));
    }
}
