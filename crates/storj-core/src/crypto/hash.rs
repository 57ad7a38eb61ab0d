//! SHA-256 and RIPEMD160(SHA256) hashing.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Computes SHA-256 over the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Computes RIPEMD160(SHA256(data)), the network's content and identity hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let rmd = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&rmd);
    out
}

/// Incremental hash160 over a byte stream.
///
/// The SHA-256 stage is streamed; the RIPEMD160 stage runs over the 32-byte
/// SHA digest at finalization, so arbitrarily large inputs hash in constant
/// memory.
#[derive(Clone)]
pub struct Hash160Hasher {
    sha: Sha256,
}

impl Hash160Hasher {
    /// Creates a fresh hasher.
    pub fn new() -> Self {
        Self { sha: Sha256::new() }
    }

    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.sha.update(data);
    }

    /// Finalizes and returns the 20-byte digest.
    pub fn finalize(self) -> [u8; 20] {
        let sha = self.sha.finalize();
        let rmd = Ripemd160::digest(sha);
        let mut out = [0u8; 20];
        out.copy_from_slice(&rmd);
        out
    }
}

impl Default for Hash160Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash160_matches_streaming() {
        let data = b"hello storj";
        let mut hasher = Hash160Hasher::new();
        hasher.update(&data[..5]);
        hasher.update(&data[5..]);
        assert_eq!(hasher.finalize(), hash160(data));
    }

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash160_empty_is_stable() {
        assert_eq!(hash160(b""), hash160(b""));
        assert_ne!(hash160(b""), hash160(b"x"));
    }
}
