//! Renter-side audit generation.
//!
//! The generator streams the shard once while keeping one hasher per
//! challenge, so audit preparation is a single pass regardless of the
//! audit count.

use std::fmt;

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use storj_core::{hash160, Hash160Hasher, CHALLENGE_SIZE};

use crate::merkle::MerkleTree;
use crate::AuditError;

/// A random 16-byte audit challenge, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Challenge(pub [u8; CHALLENGE_SIZE]);

impl Challenge {
    /// Generates a fresh random challenge.
    pub fn random() -> Self {
        let mut bytes = [0u8; CHALLENGE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != CHALLENGE_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; CHALLENGE_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", self.to_hex())
    }
}

impl Serialize for Challenge {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Challenge {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl<'de> Visitor<'de> for HexVisitor {
            type Value = Challenge;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a 32-character hex string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Challenge::from_hex(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// The renter's private half of an audit set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateRecord {
    /// Unused challenges, consumed one per audit.
    pub challenges: Vec<Challenge>,
    /// Merkle root the farmer's proofs must reduce to.
    pub root: [u8; 20],
    /// Tree depth proofs must match.
    pub depth: usize,
}

/// A finalized audit set: challenges, leaves, and the tree over them.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    challenges: Vec<Challenge>,
    leaves: Vec<[u8; 20]>,
    tree: MerkleTree,
}

impl AuditRecord {
    /// Returns the private record the renter keeps.
    pub fn private_record(&self) -> PrivateRecord {
        PrivateRecord {
            challenges: self.challenges.clone(),
            root: self.tree.root(),
            depth: self.tree.depth(),
        }
    }

    /// Returns the public record handed to the farmer: one leaf per
    /// challenge, without padding.
    pub fn public_record(&self) -> Vec<[u8; 20]> {
        self.leaves.clone()
    }

    /// Returns the challenges.
    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    /// Returns the Merkle tree.
    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }
}

/// Streaming audit generator.
///
/// Feed the shard bytes in any chunking; every chunk updates all N hashers.
pub struct AuditStream {
    challenges: Vec<Challenge>,
    hashers: Vec<Hash160Hasher>,
}

impl AuditStream {
    /// Creates a generator with `audit_count` fresh random challenges.
    pub fn new(audit_count: usize) -> Result<Self, AuditError> {
        if audit_count == 0 {
            return Err(AuditError::InvalidAuditCount);
        }

        let challenges: Vec<Challenge> = (0..audit_count).map(|_| Challenge::random()).collect();
        let hashers = challenges
            .iter()
            .map(|c| {
                let mut hasher = Hash160Hasher::new();
                hasher.update(c.as_bytes());
                hasher
            })
            .collect();

        Ok(Self {
            challenges,
            hashers,
        })
    }

    /// Feeds a chunk of the shard into every challenge hasher.
    pub fn update(&mut self, chunk: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(chunk);
        }
    }

    /// Finalizes the audit set and builds the Merkle tree.
    pub fn finalize(self) -> AuditRecord {
        let leaves: Vec<[u8; 20]> = self
            .hashers
            .into_iter()
            .map(|hasher| {
                // Double hash: the preimage stays secret to the renter until
                // a farmer proves it from the shard bytes.
                let preimage = hasher.finalize();
                hash160(&preimage)
            })
            .collect();

        let tree = MerkleTree::from_leaves(leaves.clone());

        AuditRecord {
            challenges: self.challenges,
            leaves,
            tree,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_count_rejected() {
        assert!(matches!(
            AuditStream::new(0),
            Err(AuditError::InvalidAuditCount)
        ));
    }

    #[test]
    fn test_leaf_construction() {
        let mut stream = AuditStream::new(3).unwrap();
        stream.update(b"hello storj");
        let record = stream.finalize();

        for (challenge, leaf) in record.challenges().iter().zip(record.public_record()) {
            let mut preimage_input = challenge.as_bytes().to_vec();
            preimage_input.extend_from_slice(b"hello storj");
            let preimage = hash160(&preimage_input);
            assert_eq!(leaf, hash160(&preimage));
        }
    }

    #[test]
    fn test_chunking_is_irrelevant() {
        let mut whole = AuditStream::new(4).unwrap();
        whole.update(b"hello storj");
        let whole = whole.finalize();

        // Same challenges, different chunking: rebuild hashers manually.
        let mut split = AuditStream::new(4).unwrap();
        split.challenges = whole.challenges().to_vec();
        split.hashers = split
            .challenges
            .iter()
            .map(|c| {
                let mut hasher = Hash160Hasher::new();
                hasher.update(c.as_bytes());
                hasher
            })
            .collect();
        split.update(b"hello");
        split.update(b" storj");
        let split = split.finalize();

        assert_eq!(whole.tree().root(), split.tree().root());
    }

    #[test]
    fn test_private_record_shape() {
        let mut stream = AuditStream::new(12).unwrap();
        stream.update(b"hello storj");
        let record = stream.finalize();

        let private = record.private_record();
        assert_eq!(private.challenges.len(), 12);
        assert_eq!(private.depth, 4);
        assert_eq!(private.root, record.tree().root());
        assert_eq!(record.public_record().len(), 12);
    }

    #[test]
    fn test_challenge_hex_roundtrip() {
        let challenge = Challenge::random();
        let parsed = Challenge::from_hex(&challenge.to_hex()).unwrap();
        assert_eq!(challenge, parsed);
    }
}
