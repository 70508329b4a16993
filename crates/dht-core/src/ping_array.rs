//! Bounded ring of outstanding ping nonces.
//!
//! Every outgoing get-nodes (and NAT-ping) carries a freshly issued nonce;
//! the array binds that nonce to the target key and endpoint until either a
//! matching reply arrives or `PING_TIMEOUT_SECS` elapses, whichever is
//! first. Entries past deadline are only reclaimed lazily, on the next
//! `add`/`check` that happens to land on their slot.

use rand::RngCore;

use crate::wire::{IpPort, NodeKey};
use crate::{DHT_PING_ARRAY_SIZE, PING_TIMEOUT_SECS};

struct Entry {
    nonce: u64,
    target_key: NodeKey,
    target_endpoint: IpPort,
    deadline: u64,
}

/// Fixed-capacity ring of outstanding challenge nonces.
pub struct PingArray {
    slots: Vec<Option<Entry>>,
}

impl PingArray {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(DHT_PING_ARRAY_SIZE);
        slots.resize_with(DHT_PING_ARRAY_SIZE, || None);
        Self { slots }
    }

    fn slot_index(nonce: u64) -> usize {
        (nonce as usize) % DHT_PING_ARRAY_SIZE
    }

    fn is_expired(entry: &Entry, now: u64) -> bool {
        now >= entry.deadline
    }

    /// Register a new outstanding ping to `target_key` at `target_endpoint`,
    /// returning the nonce to embed in the outgoing packet.
    pub fn add(&mut self, target_key: NodeKey, target_endpoint: IpPort, now: u64) -> u64 {
        loop {
            let nonce = rand::rngs::OsRng.next_u64();
            let idx = Self::slot_index(nonce);
            let free = match &self.slots[idx] {
                None => true,
                Some(e) => Self::is_expired(e, now),
            };
            if free {
                self.slots[idx] = Some(Entry {
                    nonce,
                    target_key,
                    target_endpoint,
                    deadline: now + PING_TIMEOUT_SECS,
                });
                return nonce;
            }
            // Slot occupied by a live entry: draw another nonce.
        }
    }

    /// Validate and consume a reply nonce. On success, clears the slot and
    /// returns the endpoint the original ping targeted.
    pub fn check(&mut self, nonce: u64, target_key: &NodeKey, now: u64) -> Option<IpPort> {
        let idx = Self::slot_index(nonce);
        let matches = match &self.slots[idx] {
            Some(e) => e.nonce == nonce && &e.target_key == target_key && !Self::is_expired(e, now),
            None => false,
        };
        if matches {
            self.slots[idx].take().map(|e| e.target_endpoint)
        } else {
            None
        }
    }
}

impl Default for PingArray {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn ep(port: u16) -> IpPort {
        IpPort::udp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_add_then_check_succeeds() {
        let mut arr = PingArray::new();
        let key = [0x01; 32];
        let nonce = arr.add(key, ep(1), 0);

        let result = arr.check(nonce, &key, 1);
        assert_eq!(result, Some(ep(1)));
    }

    #[test]
    fn test_check_clears_slot() {
        let mut arr = PingArray::new();
        let key = [0x02; 32];
        let nonce = arr.add(key, ep(2), 0);

        assert!(arr.check(nonce, &key, 1).is_some());
        // Second check against the same nonce fails: slot was cleared.
        assert!(arr.check(nonce, &key, 1).is_none());
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut arr = PingArray::new();
        let nonce = arr.add([0x03; 32], ep(3), 0);
        assert!(arr.check(nonce, &[0x04; 32], 1).is_none());
    }

    #[test]
    fn test_expired_entry_fails() {
        let mut arr = PingArray::new();
        let key = [0x05; 32];
        let nonce = arr.add(key, ep(5), 0);

        let result = arr.check(nonce, &key, PING_TIMEOUT_SECS + 1);
        assert!(result.is_none());
    }

    #[test]
    fn test_unknown_nonce_fails() {
        let mut arr = PingArray::new();
        assert!(arr.check(0xdead_beef, &[0x06; 32], 0).is_none());
    }

    #[test]
    fn test_expired_slot_is_reclaimed() {
        let mut arr = PingArray::new();
        let key_a = [0x07; 32];
        let nonce_a = arr.add(key_a, ep(7), 0);

        // Force a second add long after the first expired; it may reuse the
        // same slot index once expired, which is a valid/expected outcome.
        let key_b = [0x08; 32];
        let _ = arr.add(key_b, ep(8), PING_TIMEOUT_SECS + 100);

        // The original nonce, now past its deadline, must not validate.
        assert!(arr.check(nonce_a, &key_a, PING_TIMEOUT_SECS + 100).is_none());
    }
}
