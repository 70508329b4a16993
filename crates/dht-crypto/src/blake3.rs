//! BLAKE3 hashing for the Meridian DHT.
//!
//! A peer's identity *is* its 32-byte public key — there is no derived node
//! ID. BLAKE3 is used only to produce short, log-safe fingerprints of keys,
//! so `tracing` output doesn't spray full public keys into shared logs.

const FINGERPRINT_CONTEXT: &str = "meridian dht v1 log fingerprint";

/// Compute the BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// An 8-hex-character fingerprint of a key, safe to include in log lines in
/// place of the full key. Domain-separated so it can't be correlated with
/// BLAKE3 digests computed elsewhere for unrelated purposes.
pub fn short_fingerprint(key: &[u8]) -> String {
    let mut out = [0u8; 4];
    let mut hasher = ::blake3::Hasher::new_derive_key(FINGERPRINT_CONTEXT);
    hasher.update(key);
    hasher.finalize_xof().fill(&mut out);
    hex::encode(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let result1 = hash(b"meridian test vector 1");
        let result2 = hash(b"meridian test vector 1");
        assert_eq!(result1, result2);
    }

    #[test]
    fn test_hash_different_inputs() {
        let result1 = hash(b"input1");
        let result2 = hash(b"input2");
        assert_ne!(result1, result2);
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let pk = [0x11u8; 32];
        assert_eq!(short_fingerprint(&pk), short_fingerprint(&pk));
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let pk = [0x22u8; 32];
        let fp = short_fingerprint(&pk);
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_differs_per_key() {
        let a = short_fingerprint(&[0x01u8; 32]);
        let b = short_fingerprint(&[0x02u8; 32]);
        assert_ne!(a, b);
    }
}
