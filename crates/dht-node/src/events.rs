//! Translates `dht-core`'s plain callbacks into [`dht_events::Event`]s.
//!
//! The DHT core itself has no notion of an event bus — it only calls back
//! into closures (`node_learned_cb`, the `on_ip_found` callback passed to
//! `add_friend`). This module is the seam where those callbacks become
//! broadcastable events for JSON-RPC subscribers.

use dht_events::{EventBus, EventKind};

pub fn node_added(bus: &EventBus, now: u64, key: &[u8; 32]) {
    bus.emit(
        EventKind::NodeAdded,
        now,
        serde_json::json!({ "key": dht_crypto::blake3::short_fingerprint(key) }),
    );
}

pub fn friend_ip_found(bus: &EventBus, now: u64, friend_key: &[u8; 32], ip: std::net::IpAddr, port: u16) {
    bus.emit(
        EventKind::FriendIpFound,
        now,
        serde_json::json!({
            "friend": dht_crypto::blake3::short_fingerprint(friend_key),
            "ip": ip.to_string(),
            "port": port,
        }),
    );
}

pub fn bootstrap_complete(bus: &EventBus, now: u64, close_list_size: usize) {
    bus.emit(
        EventKind::BootstrapComplete,
        now,
        serde_json::json!({ "close_list_size": close_list_size }),
    );
}

pub fn nat_state_changed(bus: &EventBus, now: u64, friend_key: &[u8; 32], state: &str) {
    bus.emit(
        EventKind::NatStateChanged,
        now,
        serde_json::json!({
            "friend": dht_crypto::blake3::short_fingerprint(friend_key),
            "state": state,
        }),
    );
}

pub fn unhandled_crypto_request(bus: &EventBus, now: u64, request_id: u8, from: std::net::SocketAddr) {
    bus.emit(
        EventKind::UnhandledCryptoRequest,
        now,
        serde_json::json!({ "request_id": request_id, "from": from.to_string() }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_added_emits_fingerprint_not_raw_key() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let key = [0xab; 32];

        node_added(&bus, 1000, &key);

        let event = rx.try_recv().expect("event");
        assert_eq!(event.kind, EventKind::NodeAdded);
        let fp = event.payload["key"].as_str().unwrap();
        assert_eq!(fp.len(), 8);
    }

    #[test]
    fn test_friend_ip_found_payload_shape() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let key = [0x01; 32];
        let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();

        friend_ip_found(&bus, 2000, &key, ip, 33445);

        let event = rx.try_recv().expect("event");
        assert_eq!(event.payload["port"], 33445);
        assert_eq!(event.payload["ip"], "127.0.0.1");
    }
}
