//! Binary wire codec for endpoints and node records.
//!
//! Every DHT packet that carries an address does so in this fixed binary
//! shape rather than through `serde`: the format must be bit-exact across
//! implementations and must round-trip through [`crate::persist`] without
//! drift, so it is hand-rolled instead of derived.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{DhtError, Result};

/// Address family tag bits (`pack_ip_port`/`unpack_ip_port`).
mod family {
    pub const V4: u8 = 0x02;
    pub const V6: u8 = 0x0a;
    pub const TCP_FLAG: u8 = 0x80;
}

/// A node's public key, 32 bytes.
pub type NodeKey = [u8; 32];

/// An endpoint: an IPv4 or IPv6 address plus a UDP port, with an optional
/// TCP-relay flag carried by the family tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpPort {
    pub addr: SocketAddr,
    pub is_tcp: bool,
}

impl IpPort {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            addr,
            is_tcp: false,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self { addr, is_tcp: true }
    }
}

/// A node record: a public key plus the endpoint it was last seen at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedNode {
    pub key: NodeKey,
    pub ip_port: IpPort,
}

/// Size in bytes of a packed `IP_Port` for a given family tag.
fn family_size(tag: u8) -> Option<usize> {
    match tag & !family::TCP_FLAG {
        family::V4 => Some(1 + 16 + 2),
        family::V6 => Some(1 + 16 + 2),
        _ => None,
    }
}

/// Pack an endpoint: `[family:1] [addr:16] [port:2 BE]`.
///
/// IPv4 addresses are left-padded with zeros to 16 bytes.
pub fn pack_ip_port(ep: &IpPort, out: &mut Vec<u8>) {
    let (tag, addr_bytes): (u8, [u8; 16]) = match ep.addr.ip() {
        IpAddr::V4(v4) => {
            let mut buf = [0u8; 16];
            buf[12..16].copy_from_slice(&v4.octets());
            (family::V4, buf)
        }
        IpAddr::V6(v6) => (family::V6, v6.octets()),
    };
    let tag = if ep.is_tcp { tag | family::TCP_FLAG } else { tag };
    out.push(tag);
    out.extend_from_slice(&addr_bytes);
    out.extend_from_slice(&ep.addr.port().to_be_bytes());
}

/// Unpack an endpoint, accepting TCP variants only when `allow_tcp` is set.
///
/// Returns the decoded endpoint and the number of bytes consumed.
pub fn unpack_ip_port(data: &[u8], allow_tcp: bool) -> Result<(IpPort, usize)> {
    let tag = *data
        .first()
        .ok_or_else(|| DhtError::MalformedRecord("empty IP_Port".into()))?;
    let is_tcp = tag & family::TCP_FLAG != 0;
    if is_tcp && !allow_tcp {
        return Err(DhtError::MalformedRecord(format!(
            "TCP family 0x{tag:02x} not permitted here"
        )));
    }
    let size = family_size(tag)
        .ok_or_else(|| DhtError::MalformedRecord(format!("unknown address family 0x{tag:02x}")))?;
    if data.len() < size {
        return Err(DhtError::MalformedRecord("truncated IP_Port".into()));
    }

    let addr_bytes = &data[1..17];
    let port = u16::from_be_bytes([data[17], data[18]]);

    let ip = match tag & !family::TCP_FLAG {
        family::V4 => IpAddr::V4(Ipv4Addr::new(
            addr_bytes[12],
            addr_bytes[13],
            addr_bytes[14],
            addr_bytes[15],
        )),
        family::V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr_bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => unreachable!("validated by family_size"),
    };

    Ok((
        IpPort {
            addr: SocketAddr::new(ip, port),
            is_tcp,
        },
        size,
    ))
}

/// Pack a list of nodes as `(packed_ip_port || 32-byte public key)` records.
pub fn pack_nodes(nodes: &[PackedNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * (19 + 32));
    for node in nodes {
        pack_ip_port(&node.ip_port, &mut out);
        out.extend_from_slice(&node.key);
    }
    out
}

/// Unpack a node-record list, stopping cleanly at the first partial record.
///
/// Returns the decoded nodes and the number of bytes consumed, so callers
/// can distinguish trailing padding from mid-record corruption.
pub fn unpack_nodes(data: &[u8], allow_tcp: bool) -> Result<(Vec<PackedNode>, usize)> {
    let mut nodes = Vec::new();
    let mut offset = 0;

    loop {
        if offset >= data.len() {
            break;
        }
        let remaining = &data[offset..];
        let (ip_port, consumed) = match unpack_ip_port(remaining, allow_tcp) {
            Ok(v) => v,
            Err(_) => break,
        };
        if remaining.len() < consumed + 32 {
            break;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&remaining[consumed..consumed + 32]);
        nodes.push(PackedNode { key, ip_port });
        offset += consumed + 32;
    }

    Ok((nodes, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(port: u16) -> IpPort {
        IpPort::udp(SocketAddr::from(([192, 168, 1, 7], port)))
    }

    fn v6(port: u16) -> IpPort {
        IpPort::udp(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            port,
        ))
    }

    #[test]
    fn test_pack_unpack_v4_roundtrip() {
        let ep = v4(33445);
        let mut buf = Vec::new();
        pack_ip_port(&ep, &mut buf);
        let (decoded, consumed) = unpack_ip_port(&buf, false).expect("unpack");
        assert_eq!(decoded, ep);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_pack_unpack_v6_roundtrip() {
        let ep = v6(443);
        let mut buf = Vec::new();
        pack_ip_port(&ep, &mut buf);
        let (decoded, _) = unpack_ip_port(&buf, false).expect("unpack");
        assert_eq!(decoded, ep);
    }

    #[test]
    fn test_tcp_variant_rejected_unless_allowed() {
        let ep = IpPort::tcp(SocketAddr::from(([10, 0, 0, 1], 3389)));
        let mut buf = Vec::new();
        pack_ip_port(&ep, &mut buf);

        assert!(unpack_ip_port(&buf, false).is_err());
        let (decoded, _) = unpack_ip_port(&buf, true).expect("unpack with tcp allowed");
        assert_eq!(decoded, ep);
        assert!(decoded.is_tcp);
    }

    #[test]
    fn test_unknown_family_byte_fails() {
        let buf = vec![0xffu8; 19];
        assert!(unpack_ip_port(&buf, true).is_err());
    }

    #[test]
    fn test_truncated_fails() {
        let ep = v4(1234);
        let mut buf = Vec::new();
        pack_ip_port(&ep, &mut buf);
        buf.truncate(buf.len() - 1);
        assert!(unpack_ip_port(&buf, false).is_err());
    }

    #[test]
    fn test_pack_unpack_nodes_roundtrip() {
        let nodes = vec![
            PackedNode {
                key: [0x01; 32],
                ip_port: v4(1),
            },
            PackedNode {
                key: [0x02; 32],
                ip_port: v6(2),
            },
        ];
        let packed = pack_nodes(&nodes);
        let (decoded, consumed) = unpack_nodes(&packed, false).expect("unpack");
        assert_eq!(decoded, nodes);
        assert_eq!(consumed, packed.len());
    }

    #[test]
    fn test_unpack_nodes_stops_at_partial_record() {
        let nodes = vec![PackedNode {
            key: [0xaa; 32],
            ip_port: v4(7),
        }];
        let mut packed = pack_nodes(&nodes);
        packed.extend_from_slice(&[0x02, 0x00, 0x00]); // partial trailing record

        let (decoded, consumed) = unpack_nodes(&packed, false).expect("unpack");
        assert_eq!(decoded, nodes);
        assert_eq!(consumed, packed.len() - 3);
    }

    #[test]
    fn test_unpack_nodes_empty() {
        let (decoded, consumed) = unpack_nodes(&[], false).expect("unpack");
        assert!(decoded.is_empty());
        assert_eq!(consumed, 0);
    }
}
