//! Service status publication.
//!
//! Health checks end in a [`ServiceStatusUpdate`] handed to a [`StatusSink`].
//! Whatever fans these out to UIs lives outside this crate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::service::{ServiceHealth, ServiceKind};

/// Default capacity of [`BroadcastStatusSink`].
const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusUpdate {
    pub service_id: String,
    pub kind: ServiceKind,
    pub health: ServiceHealth,
    pub is_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub trait StatusSink: Send + Sync {
    fn publish(&self, update: ServiceStatusUpdate);
}

/// Drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn publish(&self, _update: ServiceStatusUpdate) {}
}

/// Fans updates out over a tokio broadcast channel. Slow subscribers lag
/// and lose the oldest updates; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastStatusSink {
    sender: broadcast::Sender<ServiceStatusUpdate>,
}

impl BroadcastStatusSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceStatusUpdate> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastStatusSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusSink for BroadcastStatusSink {
    fn publish(&self, update: ServiceStatusUpdate) {
        // No subscribers is fine.
        let _ = self.sender.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str) -> ServiceStatusUpdate {
        ServiceStatusUpdate {
            service_id: id.into(),
            kind: ServiceKind::RemoteMcp,
            health: ServiceHealth::Healthy,
            is_connected: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let sink = BroadcastStatusSink::default();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        sink.publish(update("svc"));
        assert_eq!(a.recv().await.unwrap().service_id, "svc");
        assert_eq!(b.recv().await.unwrap().service_id, "svc");
    }

    #[test]
    fn test_publish_without_subscribers() {
        BroadcastStatusSink::new(0).publish(update("svc"));
        NoopStatusSink.publish(update("svc"));
    }

    #[test]
    fn test_update_serializes_camel_case() {
        let value = serde_json::to_value(update("svc")).unwrap();
        assert_eq!(value["serviceId"], "svc");
        assert_eq!(value["isConnected"], true);
        assert!(value.get("error").is_none());
    }
}
