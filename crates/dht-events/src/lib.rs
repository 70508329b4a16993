//! Event notification bus for DHT-raised events.
//!
//! The DHT core itself never touches this crate — it reports state changes
//! through plain callbacks (`node_learned_cb`, `on_ip_found`). The host
//! binary translates those callbacks into [`Event`]s and broadcasts them
//! here, so multiple subscribers (a JSON-RPC client, a log sink) can observe
//! DHT activity without the core knowing either exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Envelope for all DHT events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

/// DHT-raised event categories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new node was admitted to the close list or a friend's client list.
    NodeAdded,
    /// A friend's endpoint was discovered or changed.
    FriendIpFound,
    /// `dht_bootstrap`/`dht_bootstrap_from_address` finished draining.
    BootstrapComplete,
    /// A friend's NAT traversal state machine changed phase.
    NatStateChanged,
    /// A packet arrived for an unregistered crypto-request id.
    UnhandledCryptoRequest,
}

/// Broadcast bus: every [`EventBus::emit`] fans out to all live subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers. A send with no subscribers is not
    /// an error — events are fire-and-forget.
    pub fn emit(&self, kind: EventKind, timestamp: u64, payload: serde_json::Value) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(Event { kind, timestamp, payload });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EventKind::NodeAdded, 1000, serde_json::json!({"key": "aabb"}));

        let event = rx.try_recv().expect("receive event");
        assert_eq!(event.kind, EventKind::NodeAdded);
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(EventKind::BootstrapComplete, 0, serde_json::Value::Null);
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(EventKind::NatStateChanged, 5, serde_json::json!({"friend": "cc"}));

        assert_eq!(rx1.try_recv().expect("rx1").kind, EventKind::NatStateChanged);
        assert_eq!(rx2.try_recv().expect("rx2").kind, EventKind::NatStateChanged);
    }
}
