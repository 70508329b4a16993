//! Periodic maintenance tick (`do_dht`).
//!
//! The DHT core has no suspension points: a host loop alternates between
//! draining the socket and calling [`tick`] a few times a second. Every
//! timestamp comparison in a single call uses the same cached `now` so a
//! tick is internally consistent even if wall-clock time advances while it
//! runs. Nothing here performs I/O directly — each phase appends outgoing
//! packets to the returned [`TickOutput`], which the caller sends through
//! its own [`crate::net::UdpTransport`].

use rand::seq::SliceRandom;
use tracing::debug;

use crate::protocol::{self, GetNodes};
use crate::routing::{Family, RoutingTable};
use crate::wire::IpPort;
use crate::PING_INTERVAL_SECS;

/// A friend's per-tick search pace, beyond the fixed [`PING_INTERVAL_SECS`]
/// used for close-list refresh.
pub const FRIEND_SEARCH_INTERVAL_SECS: u64 = PING_INTERVAL_SECS;

/// Escape-local-minima probe: how often a friend search also pings a
/// uniformly random known node instead of only the closest ones.
pub const FRIEND_RANDOM_PROBE_INTERVAL_SECS: u64 = PING_INTERVAL_SECS * 4;

/// Everything a single [`tick`] call decided to do.
#[derive(Default)]
pub struct TickOutput {
    pub get_nodes: Vec<PendingGetNodes>,
}

/// A get-nodes the caller should seal (it holds the shared-key cache and
/// secret key) and send, registering `target` with the ping array first to
/// obtain the nonce to embed.
pub struct PendingGetNodes {
    pub to_key: [u8; 32],
    pub to_endpoint: IpPort,
    pub family: Family,
    pub search_target: [u8; 32],
}

/// Close-list refresh: re-ping any entry whose `last_pinged` has aged past
/// `PING_INTERVAL_SECS`, and drop entries that have gone bad.
pub fn refresh_close_list(table: &mut RoutingTable, now: u64, out: &mut TickOutput) {
    table.evict_bad(now);

    let self_key = table.self_key;
    let stale: Vec<(crate::wire::NodeKey, IpPort, Family)> = table
        .close
        .entries()
        .filter_map(|entry| {
            let (endpoint, family) = if now.saturating_sub(entry.assoc4.last_pinged) >= PING_INTERVAL_SECS {
                entry.assoc4.endpoint.map(|e| (e, Family::V4))
            } else {
                None
            }
            .or_else(|| {
                if now.saturating_sub(entry.assoc6.last_pinged) >= PING_INTERVAL_SECS {
                    entry.assoc6.endpoint.map(|e| (e, Family::V6))
                } else {
                    None
                }
            })?;
            Some((entry.key, endpoint, family))
        })
        .collect();

    for (key, endpoint, family) in stale {
        table.mark_pinged(&key, family, now);
        out.get_nodes.push(PendingGetNodes {
            to_key: key,
            to_endpoint: endpoint,
            family,
            search_target: self_key,
        });
    }
}

/// Per-friend search: query up to `MAX_SENT_NODES` of the closest known
/// nodes to each friend's key, plus an occasional random probe.
pub fn search_friends(table: &RoutingTable, now: u64, tick_count: u64, out: &mut TickOutput) {
    for friend in table.friends() {
        let mut targets: Vec<&crate::routing::ClientEntry> = friend
            .clients
            .iter()
            .filter(|c| !c.is_bad(now, crate::BAD_NODE_TIMEOUT_SECS))
            .collect();

        targets.sort_by(|a, b| {
            crate::routing::xor_distance(&friend.key, &a.key).cmp(&crate::routing::xor_distance(&friend.key, &b.key))
        });
        targets.truncate(crate::MAX_SENT_NODES);

        for entry in &targets {
            let (endpoint, family) = match (entry.assoc4.endpoint, entry.assoc6.endpoint) {
                (Some(e), _) => (e, Family::V4),
                (None, Some(e)) => (e, Family::V6),
                (None, None) => continue,
            };
            out.get_nodes.push(PendingGetNodes {
                to_key: entry.key,
                to_endpoint: endpoint,
                family,
                search_target: friend.key,
            });
        }

        if tick_count % (FRIEND_RANDOM_PROBE_INTERVAL_SECS / PING_INTERVAL_SECS.max(1)).max(1) == 0 {
            if let Some(random_entry) = friend.clients.choose(&mut rand::thread_rng()) {
                if let Some(endpoint) = random_entry.assoc4.endpoint.or(random_entry.assoc6.endpoint) {
                    out.get_nodes.push(PendingGetNodes {
                        to_key: random_entry.key,
                        to_endpoint: endpoint,
                        family: if random_entry.assoc4.endpoint.is_some() {
                            Family::V4
                        } else {
                            Family::V6
                        },
                        search_target: friend.key,
                    });
                }
            }
        }
    }
}

/// A bootstrap candidate supplied through `dht_bootstrap`/`dht_bootstrap_from_address`,
/// queued until the next tick converts it into a single get-nodes for our own key.
pub struct BootstrapCandidate {
    pub key: [u8; 32],
    pub endpoint: IpPort,
}

/// Drain queued bootstrap candidates into get-nodes requests for our own key.
pub fn drain_bootstrap(self_key: [u8; 32], pending: Vec<BootstrapCandidate>, out: &mut TickOutput) {
    for candidate in pending {
        debug!(endpoint = %candidate.endpoint.addr, "draining bootstrap candidate");
        out.get_nodes.push(PendingGetNodes {
            to_key: candidate.key,
            to_endpoint: candidate.endpoint,
            family: if candidate.endpoint.addr.is_ipv4() { Family::V4 } else { Family::V6 },
            search_target: self_key,
        });
    }
}

/// Build the plaintext payload and a fresh ping-array nonce for one queued
/// get-nodes; the caller seals it under the appropriate shared key and sends it.
pub fn prepare_get_nodes(
    pending: &PendingGetNodes,
    pings: &mut crate::ping_array::PingArray,
    now: u64,
) -> (Vec<u8>, u64) {
    let nonce = pings.add(pending.to_key, pending.to_endpoint, now);
    let payload = protocol::encode_get_nodes(&GetNodes {
        target: pending.search_target,
        ping_nonce: nonce,
    });
    (payload, nonce)
}

/// One full maintenance tick. The ping array's own expiry is lazy and needs
/// no explicit call here; it reclaims slots as `add`/`check` touch them.
pub fn tick(table: &mut RoutingTable, now: u64, tick_count: u64, bootstrap_queue: Vec<BootstrapCandidate>) -> TickOutput {
    let mut out = TickOutput::default();
    refresh_close_list(table, now, &mut out);
    search_friends(table, now, tick_count, &mut out);
    drain_bootstrap(table.self_key, bootstrap_queue, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn ep(port: u16) -> IpPort {
        IpPort::udp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_refresh_close_list_pings_stale_entries() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, crate::BAD_NODE_TIMEOUT_SECS, [[0xf1; 32], [0xf2; 32]]);
        let peer = [0x80u8; 32];
        table.addto_lists(&peer, ep(1), Family::V4, 0);

        let mut out = TickOutput::default();
        refresh_close_list(&mut table, PING_INTERVAL_SECS, &mut out);
        assert_eq!(out.get_nodes.len(), 1);
        assert_eq!(out.get_nodes[0].to_key, peer);
    }

    #[test]
    fn test_refresh_close_list_skips_fresh_entries() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, crate::BAD_NODE_TIMEOUT_SECS, [[0xf1; 32], [0xf2; 32]]);
        let peer = [0x80u8; 32];
        table.addto_lists(&peer, ep(1), Family::V4, 0);

        let mut out = TickOutput::default();
        refresh_close_list(&mut table, PING_INTERVAL_SECS - 1, &mut out);
        assert!(out.get_nodes.is_empty());
    }

    #[test]
    fn test_search_friends_targets_known_clients() {
        let self_key = [0u8; 32];
        let mut table = RoutingTable::new(self_key, crate::BAD_NODE_TIMEOUT_SECS, [[0xf1; 32], [0xf2; 32]]);
        let friend_key = [0x55u8; 32];
        table.add_friend(friend_key, 1).expect("add friend");
        table.addto_lists(&[0x56; 32], ep(5), Family::V4, 0);

        let mut out = TickOutput::default();
        search_friends(&table, 0, 0, &mut out);
        assert!(out.get_nodes.iter().any(|g| g.search_target == friend_key));
    }

    #[test]
    fn test_drain_bootstrap_emits_one_per_candidate() {
        let self_key = [0u8; 32];
        let candidates = vec![
            BootstrapCandidate {
                key: [0x01; 32],
                endpoint: ep(1),
            },
            BootstrapCandidate {
                key: [0x02; 32],
                endpoint: ep(2),
            },
        ];
        let mut out = TickOutput::default();
        drain_bootstrap(self_key, candidates, &mut out);
        assert_eq!(out.get_nodes.len(), 2);
        assert!(out.get_nodes.iter().all(|g| g.search_target == self_key));
    }

    #[test]
    fn test_prepare_get_nodes_registers_ping() {
        let mut pings = crate::ping_array::PingArray::new();
        let pending = PendingGetNodes {
            to_key: [0x09; 32],
            to_endpoint: ep(9),
            family: Family::V4,
            search_target: [0x10; 32],
        };
        let (payload, nonce) = prepare_get_nodes(&pending, &mut pings, 0);
        assert!(!payload.is_empty());
        assert!(pings.check(nonce, &pending.to_key, 1).is_some());
    }
}
