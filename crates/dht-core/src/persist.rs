//! Tagged-section persistence format.
//!
//! The save file is a 4-byte file magic followed by a flat sequence of
//! self-delimiting sections:
//!
//! ```text
//! [0x4d 0x44 0x48 0x54] [len:4 LE] [section_type:2 LE] [0x11 0xCE 0x11 0xED] [payload: len bytes] ...
//! ```
//!
//! Unknown section types are skipped, not rejected — this lets newer
//! versions add sections that older binaries ignore. Only malformed length
//! framing (a section claiming more bytes than remain) or a missing/wrong
//! file magic is fatal. Loaded nodes are never trusted directly: they seed
//! the bootstrap queue and must re-earn their close-list slot through the
//! normal admission rules. The friends section stores bare 32-byte public
//! keys only — lock IDs are subscriber bookkeeping local to a running
//! process and are never meaningful across a restart.

use crate::wire::{self, NodeKey, PackedNode};
use crate::{DhtError, Result};

const FILE_MAGIC: [u8; 4] = [0x4d, 0x44, 0x48, 0x54];
const SECTION_MAGIC: [u8; 4] = [0x11, 0xce, 0x11, 0xed];
const SECTION_HEADER_LEN: usize = 4 + 2 + 4;

pub const SECTION_SELF_KEYPAIR: u16 = 0x0001;
pub const SECTION_NODES: u16 = 0x0002;
pub const SECTION_FRIENDS: u16 = 0x0003;

/// A self-identity section: the X25519 keypair that doubles as this node's
/// DHT public key and its packet-decryption secret.
pub struct SelfKeypairSection {
    pub public_key: [u8; 32],
    pub secret_key: [u8; 32],
}

/// A candidate node learned from a previous session, to be offered to the
/// bootstrap queue rather than inserted into the close list directly.
pub struct LoadedNode {
    pub node: PackedNode,
}

/// A persisted friend: just their public key. Subscriber locks are
/// session-local bookkeeping and are never written to the save file.
pub struct LoadedFriend {
    pub key: NodeKey,
}

/// Everything recovered from a save file.
#[derive(Default)]
pub struct LoadedState {
    pub self_keypair: Option<SelfKeypairSection>,
    pub nodes: Vec<LoadedNode>,
    pub friends: Vec<LoadedFriend>,
}

fn write_section(out: &mut Vec<u8>, section_type: u16, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&section_type.to_le_bytes());
    out.extend_from_slice(&SECTION_MAGIC);
    out.extend_from_slice(payload);
}

/// Serialize the self keypair, known nodes, and friends into a save buffer.
/// `friends` should already exclude fake friends (see [`crate::routing::RoutingTable::real_friends`]).
pub fn save(self_keypair: &SelfKeypairSection, nodes: &[PackedNode], friends: &[NodeKey]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&FILE_MAGIC);

    let mut keypair_payload = Vec::with_capacity(64);
    keypair_payload.extend_from_slice(&self_keypair.public_key);
    keypair_payload.extend_from_slice(&self_keypair.secret_key);
    write_section(&mut out, SECTION_SELF_KEYPAIR, &keypair_payload);

    write_section(&mut out, SECTION_NODES, &wire::pack_nodes(nodes));

    let mut friends_payload = Vec::with_capacity(friends.len() * 32);
    for key in friends {
        friends_payload.extend_from_slice(key);
    }
    write_section(&mut out, SECTION_FRIENDS, &friends_payload);

    out
}

fn parse_self_keypair(payload: &[u8]) -> Result<SelfKeypairSection> {
    if payload.len() != 64 {
        return Err(DhtError::Corrupt("self-keypair section wrong size".into()));
    }
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&payload[..32]);
    let mut secret_key = [0u8; 32];
    secret_key.copy_from_slice(&payload[32..64]);
    Ok(SelfKeypairSection { public_key, secret_key })
}

fn parse_friends(payload: &[u8]) -> Result<Vec<LoadedFriend>> {
    if payload.len() % 32 != 0 {
        return Err(DhtError::Corrupt("friends section length not a multiple of 32".into()));
    }
    Ok(payload
        .chunks_exact(32)
        .map(|chunk| {
            let mut key = [0u8; 32];
            key.copy_from_slice(chunk);
            LoadedFriend { key }
        })
        .collect())
}

/// Parse a save buffer, tolerating unknown section types but failing on
/// malformed length framing or an unrecoverable magic mismatch.
pub fn load(data: &[u8]) -> Result<LoadedState> {
    if data.is_empty() {
        return Ok(LoadedState::default());
    }
    if data.len() < FILE_MAGIC.len() || data[..FILE_MAGIC.len()] != FILE_MAGIC {
        return Err(DhtError::Corrupt("bad save file magic".into()));
    }

    let mut state = LoadedState::default();
    let mut offset = FILE_MAGIC.len();

    while offset < data.len() {
        if data.len() < offset + SECTION_HEADER_LEN {
            return Err(DhtError::Corrupt("truncated section header".into()));
        }
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().expect("checked length")) as usize;
        let section_type = u16::from_le_bytes([data[offset + 4], data[offset + 5]]);
        let magic = &data[offset + 6..offset + 10];
        if magic != SECTION_MAGIC {
            return Err(DhtError::Corrupt("bad section magic".into()));
        }

        let payload_start = offset + SECTION_HEADER_LEN;
        if data.len() < payload_start + len {
            return Err(DhtError::Corrupt("section length exceeds remaining data".into()));
        }
        let payload = &data[payload_start..payload_start + len];

        match section_type {
            SECTION_SELF_KEYPAIR => state.self_keypair = Some(parse_self_keypair(payload)?),
            SECTION_NODES => {
                let (nodes, _) = wire::unpack_nodes(payload, true)?;
                state.nodes = nodes.into_iter().map(|node| LoadedNode { node }).collect();
            }
            SECTION_FRIENDS => state.friends = parse_friends(payload)?,
            _ => {
                tracing::debug!(section_type, len, "skipping unknown persistence section");
            }
        }

        offset = payload_start + len;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::IpPort;
    use std::net::SocketAddr;

    fn node(byte: u8, port: u16) -> PackedNode {
        PackedNode {
            key: [byte; 32],
            ip_port: IpPort::udp(SocketAddr::from(([127, 0, 0, 1], port))),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let keypair = SelfKeypairSection {
            public_key: [0x01; 32],
            secret_key: [0x02; 32],
        };
        let nodes = vec![node(0x10, 1), node(0x11, 2)];
        let friends = vec![[0x20u8; 32]];

        let buf = save(&keypair, &nodes, &friends);
        assert_eq!(&buf[..FILE_MAGIC.len()], &FILE_MAGIC);
        let loaded = load(&buf).expect("load");

        let loaded_keypair = loaded.self_keypair.expect("keypair section present");
        assert_eq!(loaded_keypair.public_key, keypair.public_key);
        assert_eq!(loaded_keypair.secret_key, keypair.secret_key);

        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.nodes[0].node, nodes[0]);

        assert_eq!(loaded.friends.len(), 1);
        assert_eq!(loaded.friends[0].key, [0x20; 32]);
    }

    #[test]
    fn test_unknown_section_is_skipped_not_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FILE_MAGIC);
        let unknown_payload = b"from a future version";
        buf.extend_from_slice(&(unknown_payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0xbeefu16.to_le_bytes());
        buf.extend_from_slice(&SECTION_MAGIC);
        buf.extend_from_slice(unknown_payload);

        write_section(&mut buf, SECTION_NODES, &wire::pack_nodes(&[node(0x30, 5)]));

        let loaded = load(&buf).expect("load tolerates unknown sections");
        assert_eq!(loaded.nodes.len(), 1);
    }

    #[test]
    fn test_truncated_length_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&1000u32.to_le_bytes()); // claims far more than provided
        buf.extend_from_slice(&SECTION_NODES.to_le_bytes());
        buf.extend_from_slice(&SECTION_MAGIC);
        buf.extend_from_slice(b"short");

        assert!(load(&buf).is_err());
    }

    #[test]
    fn test_bad_section_magic_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&SECTION_NODES.to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);

        assert!(load(&buf).is_err());
    }

    #[test]
    fn test_bad_file_magic_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&SECTION_NODES.to_le_bytes());
        buf.extend_from_slice(&SECTION_MAGIC);

        assert!(load(&buf).is_err());
    }

    #[test]
    fn test_empty_buffer_loads_empty_state() {
        let loaded = load(&[]).expect("load");
        assert!(loaded.self_keypair.is_none());
        assert!(loaded.nodes.is_empty());
        assert!(loaded.friends.is_empty());
    }
}
