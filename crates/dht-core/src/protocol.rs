//! Authenticated, encrypted request/response wire protocol.
//!
//! Every DHT packet on the wire is a single UDP datagram shaped:
//!
//! ```text
//! [packet_type:1] [sender_public_key:32] [nonce:24] [ciphertext...]
//! ```
//!
//! `ciphertext` is the packet's payload sealed with XChaCha20-Poly1305 under
//! the X25519 shared key for `(sender_public_key, recipient_secret)`, with
//! `[packet_type] || [sender_public_key]` as additional authenticated data so
//! a captured ciphertext cannot be replayed under a different type or
//! impersonated sender tag.

use dht_crypto::chacha20;
use dht_crypto::x25519::X25519PublicKey;

use crate::wire::{self, NodeKey, PackedNode};
use crate::{DhtError, Result, MAX_CRYPTO_REQUEST_SIZE};

/// Get the closest nodes we know to a target key.
pub const PACKET_GET_NODES: u8 = 0x02;
/// Response to [`PACKET_GET_NODES`].
pub const PACKET_SEND_NODES: u8 = 0x04;
/// Opaque crypto-layer envelope, dispatched by `request_id` (see below).
pub const PACKET_CRYPTO_DATA: u8 = 0x20;
/// NAT hole-punching request/response, disambiguated by a one-byte subtype.
pub const PACKET_NAT_PING: u8 = 0xfe;

pub const NAT_PING_SUBTYPE_REQUEST: u8 = 0x00;
pub const NAT_PING_SUBTYPE_RESPONSE: u8 = 0x01;

/// Sub-identifiers carried inside a [`PACKET_CRYPTO_DATA`] envelope.
pub const CRYPTO_PACKET_FRIEND_REQ: u8 = 32;
pub const CRYPTO_PACKET_DHTPK: u8 = 156;
pub const CRYPTO_PACKET_NAT_PING: u8 = 254;

const HEADER_LEN: usize = 1 + 32 + chacha20::NONCE_SIZE;

/// A decoded but not-yet-decrypted frame.
pub struct Frame {
    pub packet_type: u8,
    pub sender_key: NodeKey,
    pub nonce: [u8; chacha20::NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Seal `payload` as a `packet_type` frame from `sender`, under `shared_key`.
pub fn seal(
    packet_type: u8,
    sender: &X25519PublicKey,
    shared_key: &[u8; 32],
    payload: &[u8],
) -> Result<Vec<u8>> {
    let nonce = chacha20::random_nonce();
    let sender_bytes = sender.to_bytes();

    let mut aad = Vec::with_capacity(1 + 32);
    aad.push(packet_type);
    aad.extend_from_slice(&sender_bytes);

    let ciphertext = chacha20::encrypt(shared_key, &nonce, payload, &aad)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.push(packet_type);
    out.extend_from_slice(&sender_bytes);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    if out.len() > MAX_CRYPTO_REQUEST_SIZE {
        return Err(DhtError::PacketSize {
            size: out.len(),
            min: HEADER_LEN,
            max: MAX_CRYPTO_REQUEST_SIZE,
        });
    }
    Ok(out)
}

/// Split a raw datagram into its unauthenticated frame fields, without
/// touching the ciphertext.
pub fn parse_frame(data: &[u8]) -> Result<Frame> {
    if data.len() < HEADER_LEN || data.len() > MAX_CRYPTO_REQUEST_SIZE {
        return Err(DhtError::PacketSize {
            size: data.len(),
            min: HEADER_LEN,
            max: MAX_CRYPTO_REQUEST_SIZE,
        });
    }

    let packet_type = data[0];
    let mut sender_key = [0u8; 32];
    sender_key.copy_from_slice(&data[1..33]);
    let mut nonce = [0u8; chacha20::NONCE_SIZE];
    nonce.copy_from_slice(&data[33..33 + chacha20::NONCE_SIZE]);
    let ciphertext = data[HEADER_LEN..].to_vec();

    Ok(Frame {
        packet_type,
        sender_key,
        nonce,
        ciphertext,
    })
}

/// Open a parsed `frame` under `shared_key`, checking the type/sender AAD.
pub fn open(frame: &Frame, shared_key: &[u8; 32]) -> Result<Vec<u8>> {
    let mut aad = Vec::with_capacity(1 + 32);
    aad.push(frame.packet_type);
    aad.extend_from_slice(&frame.sender_key);

    chacha20::decrypt(shared_key, &frame.nonce, &frame.ciphertext, &aad).map_err(|_| DhtError::DecryptionFailed)
}

/// Payload of a [`PACKET_GET_NODES`] request.
pub struct GetNodes {
    pub target: NodeKey,
    pub ping_nonce: u64,
}

pub fn encode_get_nodes(req: &GetNodes) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 8);
    out.extend_from_slice(&req.target);
    out.extend_from_slice(&req.ping_nonce.to_be_bytes());
    out
}

pub fn decode_get_nodes(data: &[u8]) -> Result<GetNodes> {
    if data.len() != 32 + 8 {
        return Err(DhtError::MalformedRecord("get-nodes payload size".into()));
    }
    let mut target = [0u8; 32];
    target.copy_from_slice(&data[..32]);
    let ping_nonce = u64::from_be_bytes(data[32..40].try_into().expect("checked length"));
    Ok(GetNodes { target, ping_nonce })
}

/// Payload of a [`PACKET_SEND_NODES`] response.
pub struct SendNodes {
    pub nodes: Vec<PackedNode>,
    pub ping_nonce: u64,
}

pub fn encode_send_nodes(resp: &SendNodes) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(resp.nodes.len() as u8);
    out.extend_from_slice(&wire::pack_nodes(&resp.nodes));
    out.extend_from_slice(&resp.ping_nonce.to_be_bytes());
    out
}

pub fn decode_send_nodes(data: &[u8]) -> Result<SendNodes> {
    let count = *data
        .first()
        .ok_or_else(|| DhtError::MalformedRecord("empty send-nodes payload".into()))? as usize;
    if count > crate::MAX_SENT_NODES {
        return Err(DhtError::MalformedRecord(format!(
            "send-nodes claims {count} nodes, max is {}",
            crate::MAX_SENT_NODES
        )));
    }

    let (nodes, consumed) = wire::unpack_nodes(&data[1..], true)?;
    if nodes.len() != count {
        return Err(DhtError::MalformedRecord("send-nodes count mismatch".into()));
    }

    let tail = &data[1 + consumed..];
    if tail.len() != 8 {
        return Err(DhtError::MalformedRecord("send-nodes missing ping nonce".into()));
    }
    let ping_nonce = u64::from_be_bytes(tail.try_into().expect("checked length"));

    Ok(SendNodes { nodes, ping_nonce })
}

/// Payload of a [`PACKET_NAT_PING`] message (request or response share a shape).
pub struct NatPing {
    pub subtype: u8,
    pub ping_id: u64,
}

pub fn encode_nat_ping(msg: &NatPing) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(msg.subtype);
    out.extend_from_slice(&msg.ping_id.to_be_bytes());
    out
}

pub fn decode_nat_ping(data: &[u8]) -> Result<NatPing> {
    if data.len() != 9 {
        return Err(DhtError::MalformedRecord("nat-ping payload size".into()));
    }
    let subtype = data[0];
    if subtype != NAT_PING_SUBTYPE_REQUEST && subtype != NAT_PING_SUBTYPE_RESPONSE {
        return Err(DhtError::MalformedRecord(format!("unknown nat-ping subtype {subtype}")));
    }
    let ping_id = u64::from_be_bytes(data[1..9].try_into().expect("checked length"));
    Ok(NatPing { subtype, ping_id })
}

/// A [`PACKET_CRYPTO_DATA`] frame: `[0x20][recipient_pub:32][sender_pub:32]
/// [nonce:24][ciphertext...]`. Unlike [`Frame`], the recipient is carried
/// explicitly so a handler can reject a request addressed to someone else
/// before even attempting to decrypt it.
const REQUEST_HEADER_LEN: usize = 1 + 32 + 32 + chacha20::NONCE_SIZE;

pub struct CryptoRequestFrame {
    pub recipient_key: NodeKey,
    pub sender_key: NodeKey,
    pub nonce: [u8; chacha20::NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Seal a crypto request: `request_id||data` encrypted under `shared_key`,
/// addressed to `recipient` and attributed to `sender`.
pub fn create_request(
    recipient: &X25519PublicKey,
    sender: &X25519PublicKey,
    shared_key: &[u8; 32],
    request_id: u8,
    data: &[u8],
) -> Result<Vec<u8>> {
    let nonce = chacha20::random_nonce();
    let recipient_bytes = recipient.to_bytes();
    let sender_bytes = sender.to_bytes();

    let mut plaintext = Vec::with_capacity(1 + data.len());
    plaintext.push(request_id);
    plaintext.extend_from_slice(data);

    let mut aad = Vec::with_capacity(1 + 32 + 32);
    aad.push(PACKET_CRYPTO_DATA);
    aad.extend_from_slice(&recipient_bytes);
    aad.extend_from_slice(&sender_bytes);

    let ciphertext = chacha20::encrypt(shared_key, &nonce, &plaintext, &aad)?;

    let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + ciphertext.len());
    out.push(PACKET_CRYPTO_DATA);
    out.extend_from_slice(&recipient_bytes);
    out.extend_from_slice(&sender_bytes);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    if out.len() > MAX_CRYPTO_REQUEST_SIZE {
        return Err(DhtError::PacketSize {
            size: out.len(),
            min: REQUEST_HEADER_LEN,
            max: MAX_CRYPTO_REQUEST_SIZE,
        });
    }
    Ok(out)
}

/// Split a raw datagram into its unauthenticated [`CryptoRequestFrame`]
/// fields. Fails if the outer type byte isn't [`PACKET_CRYPTO_DATA`].
pub fn parse_request_frame(data: &[u8]) -> Result<CryptoRequestFrame> {
    if data.len() < REQUEST_HEADER_LEN || data.len() > MAX_CRYPTO_REQUEST_SIZE {
        return Err(DhtError::PacketSize {
            size: data.len(),
            min: REQUEST_HEADER_LEN,
            max: MAX_CRYPTO_REQUEST_SIZE,
        });
    }
    if data[0] != PACKET_CRYPTO_DATA {
        return Err(DhtError::MalformedRecord(format!(
            "expected crypto-request type {PACKET_CRYPTO_DATA:#x}, got {:#x}",
            data[0]
        )));
    }

    let mut recipient_key = [0u8; 32];
    recipient_key.copy_from_slice(&data[1..33]);
    let mut sender_key = [0u8; 32];
    sender_key.copy_from_slice(&data[33..65]);
    let mut nonce = [0u8; chacha20::NONCE_SIZE];
    nonce.copy_from_slice(&data[65..65 + chacha20::NONCE_SIZE]);
    let ciphertext = data[REQUEST_HEADER_LEN..].to_vec();

    Ok(CryptoRequestFrame {
        recipient_key,
        sender_key,
        nonce,
        ciphertext,
    })
}

/// Open `frame` under `shared_key`, verifying it was actually addressed to
/// `self_key` before decrypting, and split the result into `(request_id,
/// body)`. A plaintext with no room for a request_id byte is rejected.
pub fn handle_request(self_key: &NodeKey, frame: &CryptoRequestFrame, shared_key: &[u8; 32]) -> Result<(u8, Vec<u8>)> {
    if &frame.recipient_key != self_key {
        return Err(DhtError::MalformedRecord("crypto-request recipient mismatch".into()));
    }

    let mut aad = Vec::with_capacity(1 + 32 + 32);
    aad.push(PACKET_CRYPTO_DATA);
    aad.extend_from_slice(&frame.recipient_key);
    aad.extend_from_slice(&frame.sender_key);

    let plaintext =
        chacha20::decrypt(shared_key, &frame.nonce, &frame.ciphertext, &aad).map_err(|_| DhtError::DecryptionFailed)?;

    if plaintext.is_empty() {
        return Err(DhtError::MalformedRecord("crypto-request payload too short for a request id".into()));
    }

    let request_id = plaintext[0];
    let body = plaintext[1..].to_vec();
    Ok((request_id, body))
}
