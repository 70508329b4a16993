//! # dht-crypto
//!
//! Cryptographic primitives for the Meridian DHT.
//!
//! No algorithm negotiation is permitted — the cryptographic suite is fixed.
//! A node's identity and its packet-decryption key are the same X25519
//! keypair; per-packet confidentiality is the resulting Diffie-Hellman
//! shared key used with the XChaCha20-Poly1305 AEAD.
//!
//! ## Modules
//!
//! - [`blake3`] — domain-separated BLAKE3 hashing, used for log-safe key fingerprints
//! - [`x25519`] — X25519 key agreement (RFC 7748), identity and shared keys
//! - [`chacha20`] — XChaCha20-Poly1305 AEAD encryption, DHT packet bodies

pub mod blake3;
pub mod chacha20;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
