//! Close list and friend lists: the DHT's routing table.
//!
//! The close list is our own k-bucket table, partitioned into
//! [`crate::LCLIENT_LENGTH`] buckets by the position of the first differing
//! bit between a candidate key and our own. Each friend additionally keeps a
//! flat, unbucketed list of the [`crate::MAX_FRIEND_CLIENTS`] known nodes
//! closest to that friend's key — admission there is ranked purely by
//! distance to the friend, not by a bucket index, since there are far too
//! few entries per friend to bucket usefully.

use std::collections::HashMap;

use crate::wire::{IpPort, NodeKey};
use crate::{
    DhtError, Result, DHT_FAKE_FRIEND_NUMBER, DHT_FRIEND_MAX_LOCKS, LCLIENT_LENGTH, MAX_FRIEND_CLIENTS,
};

/// Address family, used both for wire framing and per-entry association slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// Liveness and endpoint-reporting state for one address family of one node.
#[derive(Clone, Debug, Default)]
pub struct Assoc {
    pub endpoint: Option<IpPort>,
    pub last_heard: u64,
    pub last_pinged: u64,
    pub returned_endpoint: Option<IpPort>,
    pub returned_ts: u64,
    pub returned_is_self: bool,
}

impl Assoc {
    fn is_bad(&self, now: u64, bad_timeout: u64) -> bool {
        self.endpoint.is_none() || now.saturating_sub(self.last_heard) > bad_timeout
    }
}

/// A node known to us: its public key plus one liveness record per address family.
#[derive(Clone, Debug)]
pub struct ClientEntry {
    pub key: NodeKey,
    pub assoc4: Assoc,
    pub assoc6: Assoc,
}

impl ClientEntry {
    fn new(key: NodeKey) -> Self {
        Self {
            key,
            assoc4: Assoc::default(),
            assoc6: Assoc::default(),
        }
    }

    fn assoc(&self, family: Family) -> &Assoc {
        match family {
            Family::V4 => &self.assoc4,
            Family::V6 => &self.assoc6,
        }
    }

    fn assoc_mut(&mut self, family: Family) -> &mut Assoc {
        match family {
            Family::V4 => &mut self.assoc4,
            Family::V6 => &mut self.assoc6,
        }
    }

    /// Bad iff every family association is bad (no fresh endpoint at all).
    pub fn is_bad(&self, now: u64, bad_timeout: u64) -> bool {
        self.assoc4.is_bad(now, bad_timeout) && self.assoc6.is_bad(now, bad_timeout)
    }
}

/// XOR distance between two keys, as a big-endian 256-bit value.
pub fn xor_distance(a: &NodeKey, b: &NodeKey) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// The bucket index of `candidate` relative to `reference`: the position of
/// the highest-order differing bit, clamped to `0..LCLIENT_LENGTH`.
/// `None` for an exact match.
pub fn bucket_index(reference: &NodeKey, candidate: &NodeKey) -> Option<usize> {
    let distance = xor_distance(reference, candidate);
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let bit = i * 8 + byte.leading_zeros() as usize;
            return Some(bit.min(LCLIENT_LENGTH - 1));
        }
    }
    None
}

/// Total order over closeness to `reference`: `1` if `a` is strictly
/// closer, `2` if `b` is, `0` on tie.
pub fn id_closest(reference: &NodeKey, a: &NodeKey, b: &NodeKey) -> u8 {
    let da = xor_distance(reference, a);
    let db = xor_distance(reference, b);
    match da.cmp(&db) {
        std::cmp::Ordering::Less => 1,
        std::cmp::Ordering::Greater => 2,
        std::cmp::Ordering::Equal => 0,
    }
}

/// Bitmask returned by [`RoutingTable::addto_lists`] describing which lists
/// accepted the node.
pub const ACCEPTED_CLOSE_LIST: u32 = 1 << 0;
pub const ACCEPTED_FRIEND_LIST: u32 = 1 << 1;

/// Try to replace a slot in a fixed-capacity buffer ordered by closeness to
/// `reference`. Preference order: first free slot, else first bad slot,
/// else the slot holding the entry farthest from `reference` (only if the
/// candidate is strictly closer than it).
///
/// Returns `true` if `candidate` was inserted (new or replacing).
fn try_place(
    buffer: &mut Vec<ClientEntry>,
    capacity: usize,
    reference: &NodeKey,
    candidate_key: &NodeKey,
    now: u64,
    bad_timeout: u64,
) -> bool {
    if let Some(existing) = buffer.iter().position(|e| &e.key == candidate_key) {
        let _ = existing;
        return true; // already present; caller refreshes its Assoc separately.
    }

    if buffer.len() < capacity {
        buffer.push(ClientEntry::new(*candidate_key));
        return true;
    }

    if let Some(bad_idx) = buffer.iter().position(|e| e.is_bad(now, bad_timeout)) {
        buffer[bad_idx] = ClientEntry::new(*candidate_key);
        return true;
    }

    let farthest = buffer
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| xor_distance(reference, &a.key).cmp(&xor_distance(reference, &b.key)))
        .map(|(i, _)| i);

    if let Some(idx) = farthest {
        if id_closest(reference, candidate_key, &buffer[idx].key) == 1 {
            buffer[idx] = ClientEntry::new(*candidate_key);
            return true;
        }
    }

    false
}

/// Pure predicate: would `try_place` change this buffer for `candidate`?
fn addable(
    buffer: &[ClientEntry],
    capacity: usize,
    reference: &NodeKey,
    candidate_key: &NodeKey,
    now: u64,
    bad_timeout: u64,
) -> bool {
    if buffer.iter().any(|e| &e.key == candidate_key) {
        return true;
    }
    if buffer.len() < capacity {
        return true;
    }
    if buffer.iter().any(|e| e.is_bad(now, bad_timeout)) {
        return true;
    }
    buffer
        .iter()
        .max_by(|a, b| xor_distance(reference, &a.key).cmp(&xor_distance(reference, &b.key)))
        .is_some_and(|farthest| id_closest(reference, candidate_key, &farthest.key) == 1)
}

fn touch(entry: &mut ClientEntry, ip_port: IpPort, family: Family, now: u64) {
    let assoc = entry.assoc_mut(family);
    assoc.endpoint = Some(ip_port);
    assoc.last_heard = now;
}

/// Our own k-bucket table: [`crate::LCLIENT_LENGTH`] buckets of up to
/// [`crate::LCLIENT_NODES`] entries each.
pub struct CloseList {
    self_key: NodeKey,
    buckets: Vec<Vec<ClientEntry>>,
    bad_timeout: u64,
}

impl CloseList {
    pub fn new(self_key: NodeKey, bad_timeout: u64) -> Self {
        Self {
            self_key,
            buckets: (0..LCLIENT_LENGTH).map(|_| Vec::new()).collect(),
            bad_timeout,
        }
    }

    fn bucket_capacity(&self) -> usize {
        crate::LCLIENT_NODES
    }

    /// `true` iff placing `candidate` would change its bucket.
    pub fn addable(&self, candidate: &NodeKey, now: u64) -> bool {
        if candidate == &self.self_key {
            return false;
        }
        match bucket_index(&self.self_key, candidate) {
            Some(idx) => addable(
                &self.buckets[idx],
                self.bucket_capacity(),
                &self.self_key,
                candidate,
                now,
                self.bad_timeout,
            ),
            None => false,
        }
    }

    /// Admit or refresh `peer` at `ip_port`. Returns `true` if the close
    /// list accepted the node (newly admitted, replaced a slot, or refreshed
    /// an existing entry).
    pub fn addto(&mut self, peer: &NodeKey, ip_port: IpPort, family: Family, now: u64) -> bool {
        if peer == &self.self_key {
            return false;
        }
        let Some(idx) = bucket_index(&self.self_key, peer) else {
            return false;
        };

        let capacity = self.bucket_capacity();
        let bucket = &mut self.buckets[idx];
        let placed = try_place(
            bucket,
            capacity,
            &self.self_key,
            peer,
            now,
            self.bad_timeout,
        );
        if placed {
            if let Some(entry) = bucket.iter_mut().find(|e| &e.key == peer) {
                touch(entry, ip_port, family, now);
            }
        }
        placed
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `peer` reported seeing us at `endpoint`, for WAN/LAN
    /// inference. `is_self` marks that the reported address matches our own
    /// known endpoint.
    pub fn record_returned(&mut self, peer: &NodeKey, endpoint: IpPort, family: Family, is_self: bool, now: u64) -> bool {
        let Some(idx) = bucket_index(&self.self_key, peer) else {
            return false;
        };
        let Some(entry) = self.buckets[idx].iter_mut().find(|e| &e.key == peer) else {
            return false;
        };
        let assoc = entry.assoc_mut(family);
        assoc.returned_endpoint = Some(endpoint);
        assoc.returned_ts = now;
        assoc.returned_is_self = is_self;
        true
    }

    /// Record that we just sent `peer` a ping/get-nodes on `family`, so
    /// `refresh_close_list` doesn't re-queue it again before
    /// `PING_INTERVAL_SECS` has passed.
    pub fn mark_pinged(&mut self, peer: &NodeKey, family: Family, now: u64) {
        let Some(idx) = bucket_index(&self.self_key, peer) else {
            return;
        };
        if let Some(entry) = self.buckets[idx].iter_mut().find(|e| &e.key == peer) {
            entry.assoc_mut(family).last_pinged = now;
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ClientEntry> {
        self.buckets.iter().flatten()
    }

    pub fn bucket(&self, idx: usize) -> &[ClientEntry] {
        &self.buckets[idx]
    }

    /// Remove entries that have aged past `bad_timeout` with no live association.
    pub fn evict_bad(&mut self, now: u64) {
        for bucket in &mut self.buckets {
            bucket.retain(|e| !e.is_bad(now, self.bad_timeout));
        }
    }
}

/// A tracked peer identity: the closest known nodes to its key, plus
/// external subscriber locks. NAT state lives in [`crate::nat::NatRecord`],
/// owned by the caller alongside the routing table.
pub struct Friend {
    pub key: NodeKey,
    pub clients: Vec<ClientEntry>,
    pub is_fake: bool,
    locks: Vec<u32>,
}

impl Friend {
    fn new(key: NodeKey, is_fake: bool) -> Self {
        Self {
            key,
            clients: Vec::new(),
            is_fake,
            locks: Vec::new(),
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

/// The full routing table: our close list plus all tracked friends
/// (including the diversifying fake friends).
pub struct RoutingTable {
    pub self_key: NodeKey,
    pub close: CloseList,
    friends: Vec<Friend>,
    bad_timeout: u64,
}

impl RoutingTable {
    pub fn new(self_key: NodeKey, bad_timeout: u64, fake_friend_keys: [NodeKey; DHT_FAKE_FRIEND_NUMBER]) -> Self {
        let friends = fake_friend_keys
            .into_iter()
            .map(|k| Friend::new(k, true))
            .collect();
        Self {
            self_key,
            close: CloseList::new(self_key, bad_timeout),
            friends,
            bad_timeout,
        }
    }

    pub fn friends(&self) -> impl Iterator<Item = &Friend> {
        self.friends.iter()
    }

    pub fn friends_mut(&mut self) -> impl Iterator<Item = &mut Friend> {
        self.friends.iter_mut()
    }

    pub fn real_friends(&self) -> impl Iterator<Item = &Friend> {
        self.friends.iter().filter(|f| !f.is_fake)
    }

    pub fn find_friend(&self, key: &NodeKey) -> Option<&Friend> {
        self.friends.iter().find(|f| &f.key == key)
    }

    pub fn find_friend_mut(&mut self, key: &NodeKey) -> Option<&mut Friend> {
        self.friends.iter_mut().find(|f| &f.key == key)
    }

    /// Add a real friend, incrementing its subscriber lock count. Multiple
    /// subscribers may add the same friend; each gets a distinct lock.
    pub fn add_friend(&mut self, key: NodeKey, lock_id: u32) -> Result<()> {
        if let Some(friend) = self.friends.iter_mut().find(|f| f.key == key && !f.is_fake) {
            if friend.locks.len() >= DHT_FRIEND_MAX_LOCKS {
                return Err(DhtError::FriendList("max subscriber locks reached".into()));
            }
            friend.locks.push(lock_id);
            return Ok(());
        }
        let mut friend = Friend::new(key, false);
        friend.locks.push(lock_id);
        self.friends.push(friend);
        Ok(())
    }

    /// Release a subscriber lock; the friend is destroyed once its last lock
    /// is released.
    pub fn del_friend(&mut self, key: &NodeKey, lock_id: u32) -> Result<()> {
        let idx = self
            .friends
            .iter()
            .position(|f| &f.key == key && !f.is_fake)
            .ok_or_else(|| DhtError::FriendList("not a friend".into()))?;

        let friend = &mut self.friends[idx];
        let lock_idx = friend
            .locks
            .iter()
            .position(|l| l == &lock_id)
            .ok_or_else(|| DhtError::FriendList("unknown lock".into()))?;
        friend.locks.remove(lock_idx);

        if friend.locks.is_empty() {
            self.friends.remove(idx);
        }
        Ok(())
    }

    /// Invoked for any authenticated DHT packet from `peer`.
    pub fn addto_lists(&mut self, peer: &NodeKey, ip_port: IpPort, family: Family, now: u64) -> u32 {
        if peer == &self.self_key {
            return 0;
        }

        let mut mask = 0;
        if self.close.addto(peer, ip_port, family, now) {
            mask |= ACCEPTED_CLOSE_LIST;
        }

        let mut any_friend = false;
        for friend in &mut self.friends {
            let placed = try_place(
                &mut friend.clients,
                MAX_FRIEND_CLIENTS,
                &friend.key,
                peer,
                now,
                self.bad_timeout,
            );
            if placed {
                if let Some(entry) = friend.clients.iter_mut().find(|e| &e.key == peer) {
                    touch(entry, ip_port, family, now);
                }
                any_friend = true;
            }
        }
        if any_friend {
            mask |= ACCEPTED_FRIEND_LIST;
        }

        mask
    }

    /// `node_addable_to_close_list`: would a subsequent `addto_lists` change
    /// the close-list bucket for `candidate`?
    pub fn node_addable_to_close_list(&self, candidate: &NodeKey, now: u64) -> bool {
        self.close.addable(candidate, now)
    }

    /// The `MAX_SENT_NODES` closest known nodes to `target`, drawn from the
    /// close list and every friend list, skipping bad entries.
    pub fn get_close_nodes(&self, target: &NodeKey, family: Family, now: u64) -> Vec<(NodeKey, IpPort)> {
        let mut dedup: HashMap<NodeKey, IpPort> = HashMap::new();

        let candidates = self
            .close
            .entries()
            .chain(self.friends.iter().flat_map(|f| f.clients.iter()));

        for entry in candidates {
            if entry.is_bad(now, self.bad_timeout) {
                continue;
            }
            if let Some(ep) = entry.assoc(family).endpoint {
                dedup.entry(entry.key).or_insert(ep);
            }
        }

        let mut all: Vec<(NodeKey, IpPort)> = dedup.into_iter().collect();
        all.sort_by(|(a, _), (b, _)| xor_distance(target, a).cmp(&xor_distance(target, b)));
        all.truncate(crate::MAX_SENT_NODES);
        all
    }

    pub fn evict_bad(&mut self, now: u64) {
        self.close.evict_bad(now);
    }

    /// Forward to [`CloseList::record_returned`] for `peer`.
    pub fn record_returned(&mut self, peer: &NodeKey, endpoint: IpPort, family: Family, is_self: bool, now: u64) -> bool {
        self.close.record_returned(peer, endpoint, family, is_self, now)
    }

    /// Forward to [`CloseList::mark_pinged`] for `peer`.
    pub fn mark_pinged(&mut self, peer: &NodeKey, family: Family, now: u64) {
        self.close.mark_pinged(peer, family, now)
    }

    /// Record that `reporter` (one of `friend_key`'s tracked clients) just
    /// told us about an endpoint for the friend, for NAT reporter counting.
    pub fn record_friend_reported(&mut self, friend_key: &NodeKey, reporter: &NodeKey, endpoint: IpPort, family: Family, now: u64) -> bool {
        let Some(friend) = self.friends.iter_mut().find(|f| &f.key == friend_key) else {
            return false;
        };
        let Some(entry) = friend.clients.iter_mut().find(|e| &e.key == reporter) else {
            return false;
        };
        let assoc = entry.assoc_mut(family);
        assoc.returned_endpoint = Some(endpoint);
        assoc.returned_ts = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn key(b: u8) -> NodeKey {
        [b; 32]
    }

    fn ep(port: u16) -> IpPort {
        IpPort::udp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_id_closest_properties() {
        let r = key(0x00);
        let a = key(0x01);
        let b = key(0x02);
        let res_ab = id_closest(&r, &a, &b);
        let res_ba = id_closest(&r, &b, &a);
        assert!(res_ab == 1 || res_ab == 2);
        if res_ab == 1 {
            assert_eq!(res_ba, 2);
        } else {
            assert_eq!(res_ba, 1);
        }
        assert_eq!(id_closest(&r, &a, &a), 0);
    }

    #[test]
    fn test_bucket_index_exact_match_is_none() {
        let k = key(0x11);
        assert_eq!(bucket_index(&k, &k), None);
    }

    #[test]
    fn test_bucket_index_first_bit() {
        let r = [0u8; 32];
        let mut c = [0u8; 32];
        c[0] = 0x80;
        assert_eq!(bucket_index(&r, &c), Some(0));
    }

    #[test]
    fn test_bucket_index_clamped() {
        let r = [0u8; 32];
        let mut c = [0u8; 32];
        c[31] = 0x01; // 255 leading zeros, clamped to LCLIENT_LENGTH-1
        assert_eq!(bucket_index(&r, &c), Some(LCLIENT_LENGTH - 1));
    }

    #[test]
    fn test_close_list_rejects_self() {
        let self_key = key(0x01);
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        let accepted = table.addto_lists(&self_key, ep(1), Family::V4, 0);
        assert_eq!(accepted, 0);
        assert!(table.close.is_empty());
    }

    #[test]
    fn test_close_list_no_duplicate_keys() {
        let self_key = key(0x00);
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        let peer = key(0x80);
        table.addto_lists(&peer, ep(1), Family::V4, 0);
        table.addto_lists(&peer, ep(2), Family::V4, 1);
        assert_eq!(table.close.len(), 1);
    }

    #[test]
    fn test_close_list_bucket_bit_invariant() {
        let self_key = key(0x00);
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        for b in 1..=20u8 {
            let mut k = [0u8; 32];
            k[0] = b;
            table.addto_lists(&k, ep(b as u16), Family::V4, 0);
        }
        for (idx, bucket) in table.close.buckets.iter().enumerate() {
            for entry in bucket {
                assert_eq!(bucket_index(&self_key, &entry.key), Some(idx));
            }
        }
    }

    #[test]
    fn test_stale_eviction_frees_bucket_slot() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);

        // Fill one bucket (all keys sharing the same leading bit pattern).
        for i in 0..crate::LCLIENT_NODES as u8 {
            let mut k = [0x80u8; 32];
            k[31] = i;
            table.addto_lists(&k, ep(i as u16), Family::V4, 0);
        }
        assert_eq!(table.close.bucket(0).len(), crate::LCLIENT_NODES);

        let mut overflow = [0x80u8; 32];
        overflow[31] = crate::LCLIENT_NODES as u8;
        // At time 0 the bucket is full of fresh entries with nothing farther
        // or bad, so admission fails.
        assert!(!table.node_addable_to_close_list(&overflow, 0));

        // After the bad-node timeout elapses with no further traffic, the
        // next candidate sees a bad slot and is admitted.
        let later = crate::BAD_NODE_TIMEOUT_SECS + 1;
        assert!(table.node_addable_to_close_list(&overflow, later));
        let accepted = table.addto_lists(&overflow, ep(99), Family::V4, later);
        assert_ne!(accepted & ACCEPTED_CLOSE_LIST, 0);
    }

    #[test]
    fn test_get_close_nodes_limits_and_sorts() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        for i in 1..=10u8 {
            let mut k = [0u8; 32];
            k[0] = i;
            table.addto_lists(&k, ep(i as u16), Family::V4, 0);
        }

        let target = key(0x05);
        let close = table.get_close_nodes(&target, Family::V4, 0);
        assert!(close.len() <= crate::MAX_SENT_NODES);
        for w in close.windows(2) {
            let d0 = xor_distance(&target, &w[0].0);
            let d1 = xor_distance(&target, &w[1].0);
            assert!(d0 <= d1);
        }
    }

    #[test]
    fn test_get_close_nodes_skips_bad() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        let peer = key(0x80);
        table.addto_lists(&peer, ep(1), Family::V4, 0);

        let later = crate::BAD_NODE_TIMEOUT_SECS + 1;
        let close = table.get_close_nodes(&peer, Family::V4, later);
        assert!(close.is_empty());
    }

    #[test]
    fn test_add_and_del_friend_lock_lifecycle() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        let friend_key = key(0x33);

        table.add_friend(friend_key, 1).expect("add first lock");
        table.add_friend(friend_key, 2).expect("add second lock");
        assert_eq!(table.find_friend(&friend_key).unwrap().lock_count(), 2);

        table.del_friend(&friend_key, 1).expect("release first lock");
        assert!(table.find_friend(&friend_key).is_some());

        table.del_friend(&friend_key, 2).expect("release last lock");
        assert!(table.find_friend(&friend_key).is_none());
    }

    #[test]
    fn test_fake_friends_present_but_not_real() {
        let self_key = [0u8; 32];
        let table = RoutingTable::new(self_key, 122, [key(0xf1), key(0xf2)]);
        assert_eq!(table.friends().count(), DHT_FAKE_FRIEND_NUMBER);
        assert_eq!(table.real_friends().count(), 0);
    }
}
