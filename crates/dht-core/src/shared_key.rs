//! Per-peer shared-key cache.
//!
//! Every DHT packet is sealed under an X25519-derived symmetric key. Since
//! the same peer is contacted repeatedly, the derived key is memoized here
//! rather than recomputed on every packet. Slots are indexed by the first
//! byte of the peer's public key, with per-slot LRU eviction — there is no
//! global sweep; idle entries are simply overwritten on the next miss to
//! that slot once `KEYS_TIMEOUT_SECS` has elapsed.

use dht_crypto::x25519::{SharedSecret, X25519PublicKey, X25519StaticSecret};

use crate::{KEYS_TIMEOUT_SECS, KEY_CACHE_SLOTS, MAX_KEYS_PER_SLOT};

struct CacheEntry {
    peer_key: X25519PublicKey,
    shared: [u8; 32],
    uses: u64,
    last_requested: u64,
}

#[derive(Default)]
struct Slot {
    entries: Vec<CacheEntry>,
}

/// Cache of derived X25519 shared secrets, one slot per possible leading
/// public-key byte.
pub struct SharedKeyCache {
    slots: Vec<Slot>,
}

impl SharedKeyCache {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(KEY_CACHE_SLOTS);
        slots.resize_with(KEY_CACHE_SLOTS, Slot::default);
        Self { slots }
    }

    /// Look up (or compute and cache) the shared key for `peer_key` under
    /// `secret`. `now` is the cached monotonic clock reading for this tick,
    /// in seconds.
    pub fn get_shared_key(
        &mut self,
        secret: &X25519StaticSecret,
        peer_key: &X25519PublicKey,
        now: u64,
    ) -> [u8; 32] {
        let slot = &mut self.slots[peer_key.slot_byte() as usize];

        if let Some(entry) = slot.entries.iter_mut().find(|e| &e.peer_key == peer_key) {
            entry.uses += 1;
            entry.last_requested = now;
            return entry.shared;
        }

        let shared = secret.diffie_hellman(peer_key);
        let shared_bytes = *shared.as_bytes();
        insert(slot, peer_key, shared, now);
        shared_bytes
    }

    /// Number of distinct peers currently cached, for diagnostics.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

fn insert(slot: &mut Slot, peer_key: &X25519PublicKey, shared: SharedSecret, now: u64) {
    let entry = CacheEntry {
        peer_key: *peer_key,
        shared: *shared.as_bytes(),
        uses: 1,
        last_requested: now,
    };

    if slot.entries.len() < MAX_KEYS_PER_SLOT {
        slot.entries.push(entry);
        return;
    }

    // Evict the least-recently-requested entry in this slot.
    let lru_index = slot
        .entries
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| e.last_requested)
        .map(|(i, _)| i)
        .expect("slot is non-empty when full");
    slot.entries[lru_index] = entry;
}

/// Whether a cache entry is old enough that it would be evicted regardless
/// of LRU ordering on the next miss to its slot.
pub fn is_stale(last_requested: u64, now: u64) -> bool {
    now.saturating_sub(last_requested) > KEYS_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_is_deterministic() {
        let mut cache = SharedKeyCache::new();
        let alice = X25519StaticSecret::random();
        let bob_secret = X25519StaticSecret::random();
        let bob_pub = bob_secret.public_key();

        let k1 = cache.get_shared_key(&alice, &bob_pub, 0);
        let k2 = cache.get_shared_key(&alice, &bob_pub, 1);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_dh_duals_agree() {
        let mut cache = SharedKeyCache::new();
        let alice_secret = X25519StaticSecret::random();
        let alice_pub = alice_secret.public_key();
        let bob_secret = X25519StaticSecret::random();
        let bob_pub = bob_secret.public_key();

        let alice_side = cache.get_shared_key(&alice_secret, &bob_pub, 0);
        let bob_side = cache.get_shared_key(&bob_secret, &alice_pub, 0);
        assert_eq!(alice_side, bob_side);
    }

    #[test]
    fn test_lru_eviction_picks_oldest() {
        let mut cache = SharedKeyCache::new();
        let secret = X25519StaticSecret::random();

        // Force five peers into the same slot by overwriting their first byte.
        let mut peers = Vec::new();
        for i in 0..5u8 {
            let peer_secret = X25519StaticSecret::random();
            let mut bytes = peer_secret.public_key().to_bytes();
            bytes[0] = 0x42;
            peers.push(X25519PublicKey::from_bytes(bytes));
            cache.get_shared_key(&secret, peers.last().unwrap(), i as u64);
        }

        // The fifth lookup should have evicted the first (oldest last_requested).
        let slot = &cache.slots[0x42];
        assert_eq!(slot.entries.len(), MAX_KEYS_PER_SLOT);
        assert!(!slot.entries.iter().any(|e| e.peer_key == peers[0]));
        assert!(slot.entries.iter().any(|e| e.peer_key == peers[4]));
    }

    #[test]
    fn test_is_stale() {
        assert!(!is_stale(100, 100 + KEYS_TIMEOUT_SECS));
        assert!(is_stale(100, 100 + KEYS_TIMEOUT_SECS + 1));
    }

    #[test]
    fn test_len_tracks_distinct_peers() {
        let mut cache = SharedKeyCache::new();
        let secret = X25519StaticSecret::random();
        assert!(cache.is_empty());

        let peer1 = X25519StaticSecret::random().public_key();
        let peer2 = X25519StaticSecret::random().public_key();
        cache.get_shared_key(&secret, &peer1, 0);
        cache.get_shared_key(&secret, &peer2, 0);
        assert_eq!(cache.len(), 2);

        // Repeated lookups for the same peer don't grow the cache.
        cache.get_shared_key(&secret, &peer1, 1);
        assert_eq!(cache.len(), 2);
    }
}
