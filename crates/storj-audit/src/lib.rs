//! Merkle-tree proof-of-storage audits.
//!
//! A renter generates N random challenges and hashes each against the shard
//! to build a Merkle tree. The farmer receives the shard plus the tree's
//! leaves; later, the renter sends one challenge and the farmer must answer
//! with the response hash and the authentication path to the tree root. The
//! renter verifies the path against the root it kept, proving the farmer
//! still holds every byte of the shard.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod merkle;
mod proof;
mod stream;

pub use merkle::MerkleTree;
pub use proof::{verify_proof, ProofNode, ProofStream};
pub use stream::{AuditRecord, AuditStream, Challenge, PrivateRecord};

use thiserror::Error;

/// Errors from audit generation, proving, and verification.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Audit count must be at least one.
    #[error("Audit count must be at least 1")]
    InvalidAuditCount,

    /// The challenge does not correspond to any held leaf.
    #[error("Challenge does not match any known audit leaf")]
    UnknownChallenge,

    /// Proof depth differs from the expected tree depth.
    #[error("Proof depth {actual} does not match expected depth {expected}")]
    DepthMismatch {
        /// Depth the verifier expected.
        expected: usize,
        /// Depth found in the proof.
        actual: usize,
    },

    /// Proof shape is not a valid authentication path.
    #[error("Malformed proof: {0}")]
    MalformedProof(&'static str),

    /// A hash in the proof is not a 20-byte hex digest.
    #[error("Invalid digest in proof")]
    InvalidDigest,
}
