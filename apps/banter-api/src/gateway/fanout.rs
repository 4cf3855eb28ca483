//! Broadcast hub for dispatching room events to connected sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connected session
//! subscribes and filters events locally by room subscription. The channel
//! is bounded: a receiver that falls behind observes `RecvError::Lagged`
//! and loses its oldest events without ever stalling delivery to anyone
//! else. Cross-process delivery goes through a pluggable relay.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// A payload broadcast to all connected gateway sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    /// The room this event belongs to.
    pub room_id: String,
    /// The event name (e.g. "message_received").
    pub event_name: String,
    /// Serialized event data.
    pub data: Value,
    /// Session that caused the event; that session skips its own broadcast
    /// (the sender gets a direct acknowledgement instead).
    pub origin_session: Option<String>,
}

/// Cross-process event relay, keyed by room.
///
/// A multi-process deployment plugs in a pub/sub implementation here; a
/// single-process deployment runs the no-op.
#[async_trait]
pub trait EventRelay: Send + Sync {
    async fn publish(&self, payload: &BroadcastPayload) -> Result<(), StoreError>;
}

pub struct NoopRelay;

#[async_trait]
impl EventRelay for NoopRelay {
    async fn publish(&self, _payload: &BroadcastPayload) -> Result<(), StoreError> {
        Ok(())
    }
}

/// The broadcast hub. Cloneable — store in AppState.
#[derive(Clone)]
pub struct Fanout {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
    relay: Arc<dyn EventRelay>,
}

impl Fanout {
    pub fn new(relay: Arc<dyn EventRelay>) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender, relay }
    }

    /// Subscribe to the broadcast channel. Each gateway session should call
    /// this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Dispatch a locally-originated event: every local session sees it, and
    /// the relay carries it to the other processes.
    pub async fn dispatch(&self, payload: BroadcastPayload) {
        if let Err(e) = self.relay.publish(&payload).await {
            tracing::warn!(%e, room_id = %payload.room_id, "relay publish failed");
        }
        // send() returns Err if there are no receivers — that's fine.
        let _ = self.sender.send(Arc::new(payload));
    }

    /// Deliver an event that arrived from another process. Local only —
    /// re-publishing it would loop it back through the relay.
    pub fn ingest_remote(&self, payload: BroadcastPayload) {
        let _ = self.sender.send(Arc::new(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingRelay {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventRelay for RecordingRelay {
        async fn publish(&self, payload: &BroadcastPayload) -> Result<(), StoreError> {
            self.published
                .lock()
                .unwrap()
                .push(payload.room_id.clone());
            Ok(())
        }
    }

    fn payload(room_id: &str) -> BroadcastPayload {
        BroadcastPayload {
            room_id: room_id.to_string(),
            event_name: "message_received".to_string(),
            data: serde_json::json!({}),
            origin_session: None,
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_local_subscribers_in_order() {
        let fanout = Fanout::new(Arc::new(NoopRelay));
        let mut rx = fanout.subscribe();

        fanout.dispatch(payload("room_a")).await;
        fanout.dispatch(payload("room_b")).await;

        assert_eq!(rx.recv().await.unwrap().room_id, "room_a");
        assert_eq!(rx.recv().await.unwrap().room_id, "room_b");
    }

    #[tokio::test]
    async fn dispatch_publishes_to_relay_but_ingest_does_not() {
        let relay = Arc::new(RecordingRelay {
            published: Mutex::new(Vec::new()),
        });
        let fanout = Fanout::new(relay.clone());
        let mut rx = fanout.subscribe();

        fanout.dispatch(payload("room_a")).await;
        fanout.ingest_remote(payload("room_b"));

        assert_eq!(rx.recv().await.unwrap().room_id, "room_a");
        assert_eq!(rx.recv().await.unwrap().room_id, "room_b");
        assert_eq!(*relay.published.lock().unwrap(), vec!["room_a"]);
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_not_an_error() {
        let fanout = Fanout::new(Arc::new(NoopRelay));
        fanout.dispatch(payload("room_a")).await;
    }
}
