//! Farmer-side proof generation and renter-side verification.
//!
//! A proof is a nested pair structure mirroring the authentication path:
//! each level is `[sibling, branch]` or `[branch, sibling]` depending on
//! which side the path descends, and the innermost node is the single-element
//! `[response]` carrying the response hash. Position within each pair encodes
//! left/right, so no explicit direction flags travel with the proof.

use serde::{Deserialize, Serialize};
use storj_core::{hash160, Hash160Hasher};

use crate::merkle::MerkleTree;
use crate::stream::Challenge;
use crate::AuditError;

/// One node of a serialized proof: either a sibling digest or a nested pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProofNode {
    /// A 20-byte digest, hex encoded.
    Hash(String),
    /// A nested `[left, right]` pair, or the innermost `[response]`.
    Branch(Vec<ProofNode>),
}

impl ProofNode {
    fn hash(digest: &[u8; 20]) -> Self {
        ProofNode::Hash(hex::encode(digest))
    }
}

/// Streaming proof generator run by the farmer.
///
/// Holds the public leaves and the received challenge; the shard bytes are
/// streamed through once to compute the response hash.
pub struct ProofStream {
    leaves: Vec<[u8; 20]>,
    hasher: Hash160Hasher,
}

impl ProofStream {
    /// Creates a proof generator for a challenge against the known leaves.
    pub fn new(leaves: Vec<[u8; 20]>, challenge: &Challenge) -> Self {
        let mut hasher = Hash160Hasher::new();
        hasher.update(challenge.as_bytes());
        Self { leaves, hasher }
    }

    /// Feeds a chunk of the shard.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Finalizes the response and assembles the authentication path.
    ///
    /// Fails with `UnknownChallenge` when the response does not map to any
    /// held leaf: the challenge belongs to a different shard or audit set.
    pub fn finalize(self) -> Result<ProofNode, AuditError> {
        let response = self.hasher.finalize();
        let leaf = hash160(&response);

        let index = self
            .leaves
            .iter()
            .position(|l| *l == leaf)
            .ok_or(AuditError::UnknownChallenge)?;

        let tree = MerkleTree::from_leaves(self.leaves);

        let mut node = ProofNode::Branch(vec![ProofNode::hash(&response)]);
        for level in 0..tree.depth() {
            let position = index >> level;
            let sibling = ProofNode::hash(&tree.level(level)[position ^ 1]);
            node = if position & 1 == 0 {
                ProofNode::Branch(vec![node, sibling])
            } else {
                ProofNode::Branch(vec![sibling, node])
            };
        }

        Ok(node)
    }
}

/// Verifies a proof, returning `(computed_root, expected_root)`.
///
/// The caller compares the two for equality. Collapsing recomputes
/// `hash160(response)` for the leaf and then folds `hash160(left || right)`
/// up the path; a depth mismatch or a malformed shape is an error.
pub fn verify_proof(
    proof: &ProofNode,
    expected_root: &[u8; 20],
    expected_depth: usize,
) -> Result<([u8; 20], [u8; 20]), AuditError> {
    let (value, depth, response) = collapse(proof)?;

    if response.is_none() {
        return Err(AuditError::MalformedProof("no response hash present"));
    }
    if depth != expected_depth {
        return Err(AuditError::DepthMismatch {
            expected: expected_depth,
            actual: depth,
        });
    }

    Ok((value, *expected_root))
}

/// Reduces a proof node to `(digest, path_depth, response)`.
fn collapse(node: &ProofNode) -> Result<([u8; 20], usize, Option<[u8; 20]>), AuditError> {
    match node {
        ProofNode::Hash(hex_digest) => Ok((decode_digest(hex_digest)?, 0, None)),

        ProofNode::Branch(children) => match children.as_slice() {
            // Innermost [response]: the leaf is the hash of the response.
            [ProofNode::Hash(hex_digest)] => {
                let response = decode_digest(hex_digest)?;
                Ok((hash160(&response), 0, Some(response)))
            }
            [ProofNode::Branch(_)] => Err(AuditError::MalformedProof(
                "single-element node must hold the response hash",
            )),

            [left, right] => {
                let (left_value, left_depth, left_response) = collapse(left)?;
                let (right_value, right_depth, right_response) = collapse(right)?;

                let (path_depth, response) = match (left_response, right_response) {
                    (Some(r), None) => (left_depth, Some(r)),
                    (None, Some(r)) => (right_depth, Some(r)),
                    (None, None) => {
                        return Err(AuditError::MalformedProof(
                            "pair contains no branch toward the response",
                        ))
                    }
                    (Some(_), Some(_)) => {
                        return Err(AuditError::MalformedProof(
                            "pair contains two branches toward a response",
                        ))
                    }
                };

                let mut joined = [0u8; 40];
                joined[..20].copy_from_slice(&left_value);
                joined[20..].copy_from_slice(&right_value);
                Ok((hash160(&joined), path_depth + 1, response))
            }

            _ => Err(AuditError::MalformedProof(
                "intermediate node is not a pair",
            )),
        },
    }
}

fn decode_digest(s: &str) -> Result<[u8; 20], AuditError> {
    let bytes = hex::decode(s).map_err(|_| AuditError::InvalidDigest)?;
    if bytes.len() != 20 {
        return Err(AuditError::InvalidDigest);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::AuditStream;

    const SHARD: &[u8] = b"hello storj";

    fn audit_round(count: usize, index: usize) -> (ProofNode, [u8; 20], usize) {
        let mut stream = AuditStream::new(count).unwrap();
        stream.update(SHARD);
        let record = stream.finalize();
        let private = record.private_record();

        let mut prover = ProofStream::new(record.public_record(), &private.challenges[index]);
        prover.update(SHARD);
        let proof = prover.finalize().unwrap();

        (proof, private.root, private.depth)
    }

    #[test]
    fn test_audit_roundtrip() {
        let (proof, root, depth) = audit_round(12, 5);
        let (computed, expected) = verify_proof(&proof, &root, depth).unwrap();
        assert_eq!(computed, expected);
    }

    #[test]
    fn test_every_challenge_verifies() {
        for index in 0..7 {
            let (proof, root, depth) = audit_round(7, index);
            let (computed, expected) = verify_proof(&proof, &root, depth).unwrap();
            assert_eq!(computed, expected);
        }
    }

    #[test]
    fn test_single_challenge_tree() {
        let (proof, root, depth) = audit_round(1, 0);
        assert_eq!(depth, 0);
        let (computed, expected) = verify_proof(&proof, &root, depth).unwrap();
        assert_eq!(computed, expected);
    }

    #[test]
    fn test_unknown_challenge() {
        let mut stream = AuditStream::new(4).unwrap();
        stream.update(SHARD);
        let record = stream.finalize();

        let mut prover = ProofStream::new(record.public_record(), &Challenge::random());
        prover.update(SHARD);
        assert!(matches!(
            prover.finalize(),
            Err(AuditError::UnknownChallenge)
        ));
    }

    #[test]
    fn test_wrong_shard_is_unknown_challenge() {
        let mut stream = AuditStream::new(4).unwrap();
        stream.update(SHARD);
        let record = stream.finalize();
        let challenge = record.challenges()[0];

        let mut prover = ProofStream::new(record.public_record(), &challenge);
        prover.update(b"tampered shard bytes");
        assert!(matches!(
            prover.finalize(),
            Err(AuditError::UnknownChallenge)
        ));
    }

    #[test]
    fn test_depth_mismatch_rejected() {
        let (proof, root, depth) = audit_round(12, 3);
        assert!(matches!(
            verify_proof(&proof, &root, depth + 1),
            Err(AuditError::DepthMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_sibling_changes_root() {
        let (proof, root, depth) = audit_round(8, 2);

        // Corrupt the outermost sibling digest.
        let tampered = match proof {
            ProofNode::Branch(mut children) => {
                for child in children.iter_mut() {
                    if let ProofNode::Hash(h) = child {
                        *h = hex::encode(hash160(b"forged"));
                    }
                }
                ProofNode::Branch(children)
            }
            other => other,
        };

        let (computed, expected) = verify_proof(&tampered, &root, depth).unwrap();
        assert_ne!(computed, expected);
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        // A bare hash is not a proof.
        let bare = ProofNode::Hash(hex::encode([0u8; 20]));
        assert!(matches!(
            verify_proof(&bare, &[0u8; 20], 0),
            Err(AuditError::MalformedProof(_))
        ));

        // Triplet nodes are rejected.
        let triplet = ProofNode::Branch(vec![
            ProofNode::Hash(hex::encode([1u8; 20])),
            ProofNode::Hash(hex::encode([2u8; 20])),
            ProofNode::Hash(hex::encode([3u8; 20])),
        ]);
        assert!(matches!(
            verify_proof(&triplet, &[0u8; 20], 1),
            Err(AuditError::MalformedProof(_))
        ));
    }

    #[test]
    fn test_proof_serializes_as_nested_arrays() {
        let (proof, _, _) = audit_round(4, 1);
        let json = serde_json::to_string(&proof).unwrap();
        assert!(json.starts_with('['));

        let back: ProofNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proof);
    }
}
