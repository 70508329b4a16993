//! # dht-core
//!
//! Kademlia-style distributed hash table core for the Meridian P2P messaging
//! network: given a peer's long-term public key, locate its current network
//! endpoint without a central server.
//!
//! This crate implements:
//! - a close list (our own k-bucket table) plus per-friend tracking lists
//! - an authenticated, encrypted request/response wire protocol over UDP
//! - a per-peer shared-key cache to avoid repeated Diffie-Hellman
//! - a bounded ping array binding outgoing queries to their future replies
//! - a NAT hole-punching state machine
//! - a tagged-section persistence format
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Close-list buckets (`LCLIENT_LENGTH`) | 128 |
//! | Nodes per bucket (`LCLIENT_NODES`) | 8 |
//! | Max nodes tracked per friend (`MAX_FRIEND_CLIENTS`) | 8 |
//! | Max nodes returned per get-nodes (`MAX_SENT_NODES`) | 4 |
//! | Ping-array capacity | 512 |
//! | Ping timeout | 5 s |
//! | Ping interval | 60 s |
//! | Bad-node timeout | 122 s |
//! | Shared-key cache timeout | 600 s |
//! | Fake friends | 2 |

pub mod maintain;
pub mod nat;
pub mod net;
pub mod persist;
pub mod ping_array;
pub mod protocol;
pub mod routing;
pub mod shared_key;
pub mod wire;

mod dht;
pub use dht::{Dht, DhtConfig, FriendIpResult, OutPacket, SelfAddressKind};

/// Number of buckets in the close list (one per bit of the 256-bit key space, halved).
pub const LCLIENT_LENGTH: usize = 128;

/// Close-list entries retained per bucket.
pub const LCLIENT_NODES: usize = 8;

/// Total close-list capacity.
pub const LCLIENT_LIST: usize = LCLIENT_LENGTH * LCLIENT_NODES;

/// Nodes tracked per friend.
pub const MAX_FRIEND_CLIENTS: usize = 8;

/// Max nodes returned in a single send-nodes response.
pub const MAX_SENT_NODES: usize = 4;

/// Max outstanding subscribers ("locks") per friend.
pub const DHT_FRIEND_MAX_LOCKS: usize = 32;

/// Diversifying fake friend identities generated at startup.
pub const DHT_FAKE_FRIEND_NUMBER: usize = 2;

/// Ping-array capacity.
pub const DHT_PING_ARRAY_SIZE: usize = 512;

/// Outstanding ping-array entry TTL, in seconds.
pub const PING_TIMEOUT_SECS: u64 = 5;

/// Close-list re-ping interval, in seconds.
pub const PING_INTERVAL_SECS: u64 = 60;

/// Assumed round-trip allowance added to `PING_INTERVAL` to compute `BAD_NODE_TIMEOUT`.
pub const PING_ROUNDTRIP_SECS: u64 = 2;

/// A node is bad once `now - last_heard` exceeds this, in seconds.
pub const BAD_NODE_TIMEOUT_SECS: u64 = PING_INTERVAL_SECS + (PING_INTERVAL_SECS + PING_ROUNDTRIP_SECS);

/// Shared-key cache entries become eligible for overwrite after this many seconds idle.
pub const KEYS_TIMEOUT_SECS: u64 = 600;

/// Shared-key cache slot count (indexed by first key byte).
pub const KEY_CACHE_SLOTS: usize = 256;

/// Shared-key cache entries per slot.
pub const MAX_KEYS_PER_SLOT: usize = 4;

/// Hard ceiling on any DHT packet, including the frame header.
pub const MAX_CRYPTO_REQUEST_SIZE: usize = 1024;

/// Minimum reporters required before NAT hole-punching activates for a friend.
pub const NAT_PING_MIN_REPORTERS: usize = MAX_FRIEND_CLIENTS / 2;

/// Minimum close-list reporters required for `route_to_friend` to forward a packet.
pub const ROUTE_TO_FRIEND_MIN_REPORTERS: usize = MAX_FRIEND_CLIENTS / 4;

/// Rate limit between NAT-ping request bursts, in seconds.
pub const NAT_PING_INTERVAL_SECS: u64 = 3;

/// Error types for DHT core operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// The packet is smaller than its fixed header or exceeds `MAX_CRYPTO_REQUEST_SIZE`.
    #[error("packet size {size} out of bounds (header {min}..={max})")]
    PacketSize { size: usize, min: usize, max: usize },

    /// Decryption failed (authentication tag mismatch, or unknown sender).
    #[error("packet decryption failed")]
    DecryptionFailed,

    /// The packet's leading type byte does not match any known variant.
    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    /// A send-nodes or NAT-pong echoed a nonce absent from or expired in the ping array.
    #[error("reply nonce not found in ping array")]
    UnknownPingNonce,

    /// The wire codec encountered a malformed `IP_Port` or node record.
    #[error("malformed wire record: {0}")]
    MalformedRecord(String),

    /// A friend-list operation failed because the friend already exists, is full, or is unknown.
    #[error("friend list error: {0}")]
    FriendList(String),

    /// The persisted state file has invalid section framing.
    #[error("corrupt persistence data: {0}")]
    Corrupt(String),

    /// Cryptographic error from `dht-crypto`.
    #[error("crypto error: {0}")]
    Crypto(#[from] dht_crypto::CryptoError),
}

/// Convenience result type for DHT core operations.
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(LCLIENT_LENGTH, 128);
        assert_eq!(LCLIENT_NODES, 8);
        assert_eq!(LCLIENT_LIST, 1024);
        assert_eq!(MAX_FRIEND_CLIENTS, 8);
        assert_eq!(MAX_SENT_NODES, 4);
        assert_eq!(DHT_PING_ARRAY_SIZE, 512);
        assert_eq!(BAD_NODE_TIMEOUT_SECS, 122);
        assert_eq!(KEYS_TIMEOUT_SECS, 600);
        assert_eq!(NAT_PING_MIN_REPORTERS, 4);
        assert_eq!(ROUTE_TO_FRIEND_MIN_REPORTERS, 2);
    }

    #[test]
    fn test_error_display() {
        let err = DhtError::PacketSize {
            size: 2000,
            min: 57,
            max: MAX_CRYPTO_REQUEST_SIZE,
        };
        assert!(err.to_string().contains("2000"));
    }
}
