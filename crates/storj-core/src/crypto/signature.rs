//! Compact recoverable ECDSA over secp256k1.
//!
//! Wire signatures are 65 bytes: one recovery-id byte followed by the 64-byte
//! compact `r || s` form. Verification recovers the signer's public key from
//! the signature and compares its hash160 against the claimed node identity,
//! so no public key travels alongside the signature.

use std::sync::OnceLock;

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

/// Size of a compact recoverable signature: recovery id + r || s.
pub const COMPACT_SIGNATURE_SIZE: usize = 65;

fn secp() -> &'static Secp256k1<All> {
    static CTX: OnceLock<Secp256k1<All>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::new)
}

/// Errors from signature creation or recovery.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Signature is not 65 bytes.
    #[error("Invalid signature length: expected {COMPACT_SIGNATURE_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    /// Recovery id byte is out of range.
    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    /// Underlying secp256k1 failure.
    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Generates a fresh random secret key.
pub fn generate_secret_key() -> SecretKey {
    SecretKey::new(&mut rand::thread_rng())
}

/// Derives the public key for a secret key.
pub fn derive_public_key(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp(), secret)
}

/// Signs a 32-byte digest, returning the 65-byte compact recoverable form.
pub fn sign_compact(secret: &SecretKey, digest: &[u8; 32]) -> [u8; COMPACT_SIGNATURE_SIZE] {
    let message = Message::from_digest(*digest);
    let signature = secp().sign_ecdsa_recoverable(&message, secret);
    let (recovery_id, data) = signature.serialize_compact();

    let mut out = [0u8; COMPACT_SIGNATURE_SIZE];
    out[0] = recovery_id.to_i32() as u8;
    out[1..].copy_from_slice(&data);
    out
}

/// Recovers the signing public key from a compact signature over a digest.
pub fn recover_compact(digest: &[u8; 32], signature: &[u8]) -> Result<PublicKey, SignatureError> {
    if signature.len() != COMPACT_SIGNATURE_SIZE {
        return Err(SignatureError::InvalidLength(signature.len()));
    }

    let recovery_id = RecoveryId::from_i32(signature[0] as i32)
        .map_err(|_| SignatureError::InvalidRecoveryId(signature[0]))?;
    let signature = RecoverableSignature::from_compact(&signature[1..], recovery_id)?;

    let message = Message::from_digest(*digest);
    Ok(secp().recover_ecdsa(&message, &signature)?)
}

/// Signs a 32-byte digest, returning the DER encoding.
///
/// Only the bridge HTTP authentication headers use this form; all
/// node-to-node signatures are compact.
pub fn sign_der(secret: &SecretKey, digest: &[u8; 32]) -> Vec<u8> {
    let message = Message::from_digest(*digest);
    let signature = secp().sign_ecdsa(&message, secret);
    signature.serialize_der().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash160, sha256};

    fn test_key() -> SecretKey {
        SecretKey::from_slice(&[0x42u8; 32]).unwrap()
    }

    #[test]
    fn test_sign_recover_roundtrip() {
        let secret = test_key();
        let public = derive_public_key(&secret);
        let digest = sha256(b"a message to sign");

        let signature = sign_compact(&secret, &digest);
        let recovered = recover_compact(&digest, &signature).unwrap();

        assert_eq!(recovered, public);
    }

    #[test]
    fn test_recover_wrong_digest_yields_other_key() {
        let secret = test_key();
        let public = derive_public_key(&secret);
        let signature = sign_compact(&secret, &sha256(b"signed payload"));

        // Recovery over a different digest either fails or yields a key
        // with a different identity hash.
        if let Ok(recovered) = recover_compact(&sha256(b"tampered payload"), &signature) {
            assert_ne!(hash160(&recovered.serialize()), hash160(&public.serialize()));
        }
    }

    #[test]
    fn test_invalid_length_rejected() {
        let digest = sha256(b"whatever");
        let err = recover_compact(&digest, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, SignatureError::InvalidLength(64)));
    }

    #[test]
    fn test_invalid_recovery_id_rejected() {
        let digest = sha256(b"whatever");
        let mut signature = [0u8; COMPACT_SIGNATURE_SIZE];
        signature[0] = 9;
        let err = recover_compact(&digest, &signature).unwrap_err();
        assert!(matches!(err, SignatureError::InvalidRecoveryId(9)));
    }

    #[test]
    fn test_der_signature_is_not_compact() {
        let secret = test_key();
        let der = sign_der(&secret, &sha256(b"bridge payload"));
        assert_ne!(der.len(), COMPACT_SIGNATURE_SIZE);
        assert!(der.len() >= 68 && der.len() <= 72);
    }
}
