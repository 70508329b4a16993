//! The top-level `Dht` handle: the API a host process drives.
//!
//! `Dht` owns every piece of mutable state (routing table, shared-key cache,
//! ping array, per-friend NAT records) but never touches a socket or the
//! system clock directly — callers supply `now` to every time-sensitive
//! method and are responsible for actually sending whatever bytes a method
//! returns. This keeps the core single-threaded-cooperative and trivially
//! testable: feed it packets and clock ticks, inspect what it wants to send.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};

use dht_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use tracing::{debug, info, warn};

use crate::maintain::{self, BootstrapCandidate, TickOutput};
use crate::nat::NatRecord;
use crate::persist::{self, SelfKeypairSection};
use crate::ping_array::PingArray;
use crate::protocol::{self, NatPing, SendNodes, NAT_PING_SUBTYPE_REQUEST, NAT_PING_SUBTYPE_RESPONSE};
use crate::routing::{Family, RoutingTable};
use crate::shared_key::SharedKeyCache;
use crate::wire::{IpPort, NodeKey, PackedNode};
use crate::{DhtError, Result, DHT_FAKE_FRIEND_NUMBER, ROUTE_TO_FRIEND_MIN_REPORTERS};

/// Startup configuration for a [`Dht`] instance.
pub struct DhtConfig {
    pub holepunching_enabled: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            holepunching_enabled: true,
        }
    }
}

/// Result of [`Dht::getfriendip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendIpResult {
    NotAFriend,
    NotFoundYet,
    Found(IpPort),
}

/// Result of [`Dht::ipport_self_copy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfAddressKind {
    Unknown,
    Wan,
    Lan,
}

type IpFoundCallback = Box<dyn FnMut(IpPort) + Send>;
type CryptoHandler = Box<dyn FnMut(&NodeKey, &[u8]) + Send>;
type NodeLearnedCallback = Box<dyn FnMut(PackedNode) + Send>;

/// A datagram this call wants sent, already fully encoded.
pub struct OutPacket {
    pub to: IpPort,
    pub bytes: Vec<u8>,
}

/// The DHT core. See the module documentation for the ownership model.
pub struct Dht {
    secret: X25519StaticSecret,
    self_key: NodeKey,
    config: DhtConfig,
    routing: RoutingTable,
    shared_keys: SharedKeyCache,
    pings: PingArray,
    nat_records: HashMap<NodeKey, NatRecord>,
    bootstrap_queue: Vec<BootstrapCandidate>,
    ip_found_callbacks: HashMap<(NodeKey, u32), IpFoundCallback>,
    crypto_handlers: HashMap<u8, CryptoHandler>,
    node_learned_cb: Option<NodeLearnedCallback>,
    next_lock_id: u32,
    tick_count: u64,
}

impl Dht {
    /// Bring up a new DHT instance with its own freshly generated identity
    /// key. Two random "fake friends" are created to diversify close-list
    /// refresh traffic; they are never surfaced to callers.
    pub fn new(config: DhtConfig, secret: X25519StaticSecret) -> Self {
        let self_key = secret.public_key().to_bytes();
        let fake_friends: [NodeKey; DHT_FAKE_FRIEND_NUMBER] =
            std::array::from_fn(|_| X25519StaticSecret::random().public_key().to_bytes());

        info!(
            self_key = dht_crypto::blake3::short_fingerprint(&self_key),
            "DHT instance starting"
        );

        Self {
            secret,
            self_key,
            config,
            routing: RoutingTable::new(self_key, crate::BAD_NODE_TIMEOUT_SECS, fake_friends),
            shared_keys: SharedKeyCache::new(),
            pings: PingArray::new(),
            nat_records: HashMap::new(),
            bootstrap_queue: Vec::new(),
            ip_found_callbacks: HashMap::new(),
            crypto_handlers: HashMap::new(),
            node_learned_cb: None,
            next_lock_id: 0,
            tick_count: 0,
        }
    }

    pub fn self_key(&self) -> NodeKey {
        self.self_key
    }

    /// Add a subscriber for `friend_key`, returning the lock handle this
    /// subscriber must present to [`Dht::del_friend`]. Multiple subscribers
    /// may track the same friend independently.
    pub fn add_friend(&mut self, friend_key: NodeKey, on_ip_found: Option<IpFoundCallback>) -> Result<u32> {
        let lock_id = self.next_lock_id;
        self.next_lock_id += 1;
        self.routing.add_friend(friend_key, lock_id)?;
        self.nat_records.entry(friend_key).or_insert_with(NatRecord::new);
        if let Some(cb) = on_ip_found {
            self.ip_found_callbacks.insert((friend_key, lock_id), cb);
        }
        Ok(lock_id)
    }

    pub fn del_friend(&mut self, friend_key: &NodeKey, lock_id: u32) -> Result<()> {
        self.routing.del_friend(friend_key, lock_id)?;
        self.ip_found_callbacks.remove(&(*friend_key, lock_id));
        if self.routing.find_friend(friend_key).is_none() {
            self.nat_records.remove(friend_key);
        }
        Ok(())
    }

    pub fn getfriendip(&self, friend_key: &NodeKey) -> FriendIpResult {
        let Some(friend) = self.routing.find_friend(friend_key) else {
            return FriendIpResult::NotAFriend;
        };
        friend
            .clients
            .iter()
            .find_map(|c| c.assoc4.endpoint.or(c.assoc6.endpoint))
            .map(FriendIpResult::Found)
            .unwrap_or(FriendIpResult::NotFoundYet)
    }

    /// Queue a bootstrap candidate at a known address.
    pub fn bootstrap(&mut self, key: NodeKey, endpoint: IpPort) {
        self.bootstrap_queue.push(BootstrapCandidate { key, endpoint });
    }

    /// Resolve `host` synchronously and queue the result as a bootstrap
    /// candidate, preferring an IPv6 address when `ipv6_enabled`.
    pub fn bootstrap_from_address(&mut self, host: &str, ipv6_enabled: bool, port: u16, key: NodeKey) -> Result<()> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| DhtError::MalformedRecord(format!("bootstrap address resolution failed: {e}")))?;

        let chosen = addrs
            .into_iter()
            .find(|a| ipv6_enabled || a.is_ipv4())
            .ok_or_else(|| DhtError::MalformedRecord("no usable address resolved".into()))?;

        debug!(host, %chosen, "resolved bootstrap host");
        self.bootstrap(key, IpPort::udp(chosen));
        Ok(())
    }

    /// Relay an already-sealed packet verbatim to a direct close-list
    /// neighbor. Returns the destination only; it does not re-encrypt.
    pub fn route_packet(&self, to: &NodeKey, bytes: &[u8]) -> Result<OutPacket> {
        let endpoint = self
            .routing
            .close
            .entries()
            .find(|e| &e.key == to)
            .and_then(|e| e.assoc4.endpoint.or(e.assoc6.endpoint))
            .ok_or_else(|| DhtError::FriendList("no direct route to that key".into()))?;

        Ok(OutPacket {
            to: endpoint,
            bytes: bytes.to_vec(),
        })
    }

    /// Relay `packet` to every close-list node that currently reports
    /// knowing `friend_key`, provided at least [`ROUTE_TO_FRIEND_MIN_REPORTERS`]
    /// such reporters exist.
    pub fn route_to_friend(&self, friend_key: &NodeKey, packet: &[u8]) -> Vec<OutPacket> {
        let Some(friend) = self.routing.find_friend(friend_key) else {
            return Vec::new();
        };

        let reporters: Vec<IpPort> = friend
            .clients
            .iter()
            .filter_map(|c| c.assoc4.endpoint.or(c.assoc6.endpoint))
            .collect();

        if reporters.len() < ROUTE_TO_FRIEND_MIN_REPORTERS {
            return Vec::new();
        }

        reporters
            .into_iter()
            .map(|to| OutPacket {
                to,
                bytes: packet.to_vec(),
            })
            .collect()
    }

    pub fn set_node_learned_callback(&mut self, cb: NodeLearnedCallback) {
        self.node_learned_cb = Some(cb);
    }

    pub fn register_crypto_handler(&mut self, request_id: u8, handler: CryptoHandler) {
        self.crypto_handlers.insert(request_id, handler);
    }

    /// Seal a crypto-data request addressed to `recipient` for delivery at
    /// `to`. Pairs with the dispatch in [`Dht::handle_packet`], which calls
    /// the handler registered for `request_id` via
    /// [`Dht::register_crypto_handler`] on the receiving end.
    pub fn send_crypto_request(&mut self, recipient: &NodeKey, to: IpPort, request_id: u8, data: &[u8], now: u64) -> Result<OutPacket> {
        let peer_pub = X25519PublicKey::from_bytes(*recipient);
        let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
        let bytes = protocol::create_request(&peer_pub, &self.secret.public_key(), &shared, request_id, data)?;
        Ok(OutPacket { to, bytes })
    }

    /// Total tracked nodes across the close list and all friend lists
    /// (friends may double-count entries shared with the close list).
    pub fn size(&self) -> usize {
        self.routing.close.len()
            + self
                .routing
                .friends()
                .map(|f| f.clients.len())
                .sum::<usize>()
    }

    pub fn save(&self) -> Vec<u8> {
        let nodes: Vec<PackedNode> = self
            .routing
            .close
            .entries()
            .filter_map(|e| {
                e.assoc4
                    .endpoint
                    .or(e.assoc6.endpoint)
                    .map(|ip_port| PackedNode { key: e.key, ip_port })
            })
            .collect();

        let friends: Vec<NodeKey> = self.routing.real_friends().map(|f| f.key).collect();

        persist::save(
            &SelfKeypairSection {
                public_key: self.self_key,
                secret_key: self.secret.to_bytes(),
            },
            &nodes,
            &friends,
        )
    }

    /// Restore a previous save. Loaded nodes become bootstrap candidates,
    /// never trusted close-list entries directly. The self keypair in the
    /// buffer is ignored — identity is fixed at construction.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        let loaded = persist::load(data)?;
        for n in loaded.nodes {
            self.bootstrap(n.node.key, n.node.ip_port);
        }
        for f in loaded.friends {
            self.add_friend(f.key, None)?;
        }
        Ok(())
    }

    /// WAN/LAN inference: counts recent close-list entries reporting the
    /// same endpoint for us with `returned_is_self` set.
    pub fn ipport_self_copy(&self) -> SelfAddressKind {
        let mut wan_reports = 0usize;
        let mut any_self_report = false;
        for entry in self.routing.close.entries() {
            for assoc in [&entry.assoc4, &entry.assoc6] {
                if assoc.returned_is_self {
                    any_self_report = true;
                    if matches!(assoc.returned_endpoint.map(|e| e.addr.ip()), Some(ip) if !is_private(ip)) {
                        wan_reports += 1;
                    }
                }
            }
        }
        if wan_reports > 0 {
            SelfAddressKind::Wan
        } else if any_self_report {
            SelfAddressKind::Lan
        } else {
            SelfAddressKind::Unknown
        }
    }

    /// Run one maintenance tick and return any packets it wants sent.
    pub fn tick(&mut self, now: u64) -> Vec<OutPacket> {
        self.tick_count += 1;
        let bootstrap_drain = std::mem::take(&mut self.bootstrap_queue);
        let output = maintain::tick(&mut self.routing, now, self.tick_count, bootstrap_drain);
        let mut packets = self.seal_tick_output(output, now);
        packets.extend(self.nat_tick(now));
        packets
    }

    /// Drive each friend's NAT state machine one step, emitting the NAT-ping
    /// request that starts a punch attempt and the per-tick punch bursts
    /// once a pong has put it in [`crate::nat::NatState::Punching`].
    fn nat_tick(&mut self, now: u64) -> Vec<OutPacket> {
        if !self.config.holepunching_enabled {
            return Vec::new();
        }

        let friend_keys: Vec<NodeKey> = self.routing.friends().map(|f| f.key).collect();
        let mut packets = Vec::new();

        for friend_key in friend_keys {
            let Some(friend) = self.routing.find_friend(&friend_key) else {
                continue;
            };
            let reporters = friend
                .clients
                .iter()
                .filter(|c| now.saturating_sub(c.assoc4.returned_ts.max(c.assoc6.returned_ts)) < crate::BAD_NODE_TIMEOUT_SECS)
                .count();
            let known_endpoint = friend
                .clients
                .iter()
                .find(|c| c.key == friend_key)
                .and_then(|c| c.assoc4.endpoint.or(c.assoc6.endpoint));

            let Some(rec) = self.nat_records.get_mut(&friend_key) else {
                continue;
            };

            match rec.state() {
                crate::nat::NatState::Idle => {
                    if let Some(to) = known_endpoint {
                        if NatRecord::should_start(reporters, now, rec.last_ping_sent()) {
                            let ping_id = self.pings.add(friend_key, to, now);
                            rec.mark_ping_sent(ping_id, now);
                            if let Some(packet) = self.seal_nat_ping(&friend_key, to, NAT_PING_SUBTYPE_REQUEST, ping_id, now) {
                                packets.push(packet);
                            }
                        }
                    }
                }
                crate::nat::NatState::Punching { shared_ip, .. } => {
                    if let Some(base) = known_endpoint {
                        if let Some(port) = rec.next_punch_port(base.addr.port()) {
                            let to = IpPort::udp(SocketAddr::new(shared_ip, port));
                            let ping_id = self.pings.add(friend_key, to, now);
                            if let Some(packet) = self.seal_nat_ping(&friend_key, to, NAT_PING_SUBTYPE_REQUEST, ping_id, now) {
                                packets.push(packet);
                            }
                        }
                    }
                }
                crate::nat::NatState::AwaitingPong { .. } => {}
            }
        }

        packets
    }

    fn seal_nat_ping(&mut self, friend_key: &NodeKey, to: IpPort, subtype: u8, ping_id: u64, now: u64) -> Option<OutPacket> {
        let peer_pub = X25519PublicKey::from_bytes(*friend_key);
        let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
        let payload = protocol::encode_nat_ping(&NatPing { subtype, ping_id });
        match protocol::seal(protocol::PACKET_NAT_PING, &self.secret.public_key(), &shared, &payload) {
            Ok(bytes) => Some(OutPacket { to, bytes }),
            Err(e) => {
                warn!(error = %e, "failed to seal nat-ping packet");
                None
            }
        }
    }

    fn seal_tick_output(&mut self, output: TickOutput, now: u64) -> Vec<OutPacket> {
        let mut packets = Vec::with_capacity(output.get_nodes.len());
        for pending in &output.get_nodes {
            let peer_pub = X25519PublicKey::from_bytes(pending.to_key);
            let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
            let (payload, _nonce) = maintain::prepare_get_nodes(pending, &mut self.pings, now);
            match protocol::seal(protocol::PACKET_GET_NODES, &self.secret.public_key(), &shared, &payload) {
                Ok(bytes) => packets.push(OutPacket {
                    to: pending.to_endpoint,
                    bytes,
                }),
                Err(e) => warn!(error = %e, "failed to seal get-nodes packet"),
            }
        }
        packets
    }

    /// Decrypt and dispatch one inbound datagram. Returns any reply packets
    /// to send back.
    pub fn handle_packet(&mut self, from: IpPort, data: &[u8], now: u64) -> Result<Vec<OutPacket>> {
        if data.first() == Some(&protocol::PACKET_CRYPTO_DATA) {
            return self.handle_crypto_request(from, data, now);
        }

        let frame = protocol::parse_frame(data)?;
        if frame.sender_key == self.self_key {
            return Ok(Vec::new());
        }

        let peer_pub = X25519PublicKey::from_bytes(frame.sender_key);
        let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
        let plaintext = protocol::open(&frame, &shared)?;

        let family = if from.addr.is_ipv4() { Family::V4 } else { Family::V6 };
        self.routing.addto_lists(&frame.sender_key, from, family, now);

        match frame.packet_type {
            protocol::PACKET_GET_NODES => self.handle_get_nodes(&frame.sender_key, &plaintext, from, now),
            protocol::PACKET_SEND_NODES => self.handle_send_nodes(&frame.sender_key, &plaintext, from, now),
            protocol::PACKET_NAT_PING => self.handle_nat_ping(&frame.sender_key, &plaintext, from, now),
            other => Err(DhtError::UnknownPacketType(other)),
        }
    }

    /// Handle a [`protocol::PACKET_CRYPTO_DATA`] request, which carries its
    /// own recipient/sender key pair rather than reusing the generic
    /// [`protocol::Frame`] layout.
    fn handle_crypto_request(&mut self, from: IpPort, data: &[u8], now: u64) -> Result<Vec<OutPacket>> {
        let frame = protocol::parse_request_frame(data)?;
        if frame.sender_key == self.self_key {
            return Ok(Vec::new());
        }

        let peer_pub = X25519PublicKey::from_bytes(frame.sender_key);
        let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
        let (request_id, body) = protocol::handle_request(&self.self_key, &frame, &shared)?;

        let family = if from.addr.is_ipv4() { Family::V4 } else { Family::V6 };
        self.routing.addto_lists(&frame.sender_key, from, family, now);

        if let Some(handler) = self.crypto_handlers.get_mut(&request_id) {
            handler(&frame.sender_key, &body);
        }
        Ok(Vec::new())
    }

    fn handle_get_nodes(&mut self, sender: &NodeKey, plaintext: &[u8], from: IpPort, now: u64) -> Result<Vec<OutPacket>> {
        let req = protocol::decode_get_nodes(plaintext)?;
        let family = if from.addr.is_ipv4() { Family::V4 } else { Family::V6 };
        let close = self.routing.get_close_nodes(&req.target, family, now);
        let nodes = close
            .into_iter()
            .map(|(key, ip_port)| PackedNode { key, ip_port })
            .collect();

        let response = protocol::encode_send_nodes(&SendNodes {
            nodes,
            ping_nonce: req.ping_nonce,
        });

        let peer_pub = X25519PublicKey::from_bytes(*sender);
        let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
        let sealed = protocol::seal(protocol::PACKET_SEND_NODES, &self.secret.public_key(), &shared, &response)?;
        Ok(vec![OutPacket { to: from, bytes: sealed }])
    }

    fn handle_send_nodes(&mut self, sender: &NodeKey, plaintext: &[u8], from: IpPort, now: u64) -> Result<Vec<OutPacket>> {
        let resp = protocol::decode_send_nodes(plaintext)?;
        if self.pings.check(resp.ping_nonce, sender, now).is_none() {
            return Err(DhtError::UnknownPingNonce);
        }

        for node in resp.nodes {
            let family = if node.ip_port.addr.is_ipv4() { Family::V4 } else { Family::V6 };
            let is_self = node.key == self.self_key;
            self.routing.addto_lists(&node.key, node.ip_port, family, now);
            if is_self {
                let from_family = if from.addr.is_ipv4() { Family::V4 } else { Family::V6 };
                self.routing.record_returned(sender, node.ip_port, from_family, true, now);
            } else {
                // `sender` just reported seeing `node.key` at `node.ip_port`; if
                // that key is a tracked friend, count `sender` as a reporter for
                // NAT traversal's same-IP-divergent-port evidence.
                self.routing.record_friend_reported(&node.key, sender, node.ip_port, family, now);
            }
            if let Some(cb) = &mut self.node_learned_cb {
                cb(node);
            }
        }

        Ok(Vec::new())
    }

    fn handle_nat_ping(&mut self, sender: &NodeKey, plaintext: &[u8], from: IpPort, now: u64) -> Result<Vec<OutPacket>> {
        let msg = protocol::decode_nat_ping(plaintext)?;
        match msg.subtype {
            NAT_PING_SUBTYPE_REQUEST => {
                if self.routing.find_friend(sender).is_none() {
                    return Ok(Vec::new()); // NAT pings only honored between mutual friends
                }
                let response = protocol::encode_nat_ping(&NatPing {
                    subtype: NAT_PING_SUBTYPE_RESPONSE,
                    ping_id: msg.ping_id,
                });
                let peer_pub = X25519PublicKey::from_bytes(*sender);
                let shared = self.shared_keys.get_shared_key(&self.secret, &peer_pub, now);
                let sealed = protocol::seal(protocol::PACKET_NAT_PING, &self.secret.public_key(), &shared, &response)?;
                Ok(vec![OutPacket { to: from, bytes: sealed }])
            }
            NAT_PING_SUBTYPE_RESPONSE => {
                if let Some(rec) = self.nat_records.get_mut(sender) {
                    rec.on_pong(msg.ping_id, from.addr.ip(), now);
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn is_private(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        std::net::IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}
