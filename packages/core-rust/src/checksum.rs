//! Checksum primitives for cache integrity.
//!
//! Algorithm names are open-ended strings so the inventory's algorithm
//! registry can grow without a code change; `sha256` is the well-known
//! default and the only algorithm the archive publishes today.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// The default checksum algorithm name.
pub const SHA256: &str = "sha256";

/// A checksum value paired with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Lowercase hex digest.
    pub hex: String,
    /// Algorithm name as registered in the inventory.
    pub algorithm: String,
}

impl Checksum {
    /// Creates a SHA-256 checksum from a hex digest string.
    #[must_use]
    pub fn sha256(hex: impl Into<String>) -> Self {
        Self {
            hex: hex.into(),
            algorithm: SHA256.to_string(),
        }
    }
}

/// Incremental SHA-256 digest.
///
/// Restore streams feed this as bytes flow toward a volume, so the digest
/// is ready the moment the stream ends.
#[derive(Debug, Default)]
pub struct Sha256Digest {
    hasher: Sha256,
    bytes_seen: u64,
}

impl Sha256Digest {
    /// Creates an empty digest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_seen += data.len() as u64;
    }

    /// Number of bytes fed so far.
    #[must_use]
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Consumes the digest and returns the checksum plus total byte count.
    #[must_use]
    pub fn finish(self) -> (Checksum, u64) {
        let hex = hex::encode(self.hasher.finalize());
        (Checksum::sha256(hex), self.bytes_seen)
    }
}

/// SHA-256 of a byte slice as lowercase hex.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known vector: sha256 of the empty string.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn sha256_hex_of_empty_input() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }

    #[test]
    fn incremental_digest_matches_one_shot() {
        let data = b"hello cache world";
        let mut digest = Sha256Digest::new();
        digest.update(&data[..5]);
        digest.update(&data[5..]);

        let (checksum, count) = digest.finish();
        assert_eq!(count, data.len() as u64);
        assert_eq!(checksum.hex, sha256_hex(data));
        assert_eq!(checksum.algorithm, SHA256);
    }

    #[test]
    fn empty_digest_finishes_clean() {
        let (checksum, count) = Sha256Digest::new().finish();
        assert_eq!(count, 0);
        assert_eq!(checksum.hex, EMPTY_SHA256);
    }

    #[test]
    fn checksum_json_round_trip() {
        let checksum = Checksum::sha256("abc123");
        let json = serde_json::to_string(&checksum).unwrap();
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);
    }
}
