//! Node key pairs.
//!
//! A node's identity is a secp256k1 key pair; its NodeId is the hash160 of
//! the compressed public key, so identity claims are verified by recovering
//! the public key from any compact signature.

use std::fmt;

use secp256k1::{PublicKey, SecretKey};
use zeroize::Zeroize;

use crate::crypto::{
    derive_public_key, generate_secret_key, sign_compact, sign_der, COMPACT_SIGNATURE_SIZE,
};
use crate::identifiers::NodeId;

/// Errors when constructing a key pair from external material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Secret key bytes are malformed or out of range.
    #[error("Invalid secret key: {0}")]
    InvalidSecret(#[from] secp256k1::Error),

    /// Hex decoding failed.
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Secret key is not 32 bytes.
    #[error("Invalid secret key length: {0}")]
    InvalidLength(usize),
}

/// A secp256k1 key pair with its derived node identity.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
    node_id: NodeId,
}

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        Self::from_secret(generate_secret_key())
    }

    /// Builds a key pair from an existing secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = derive_public_key(&secret);
        let node_id = NodeId::from_public_key(&public.serialize());
        Self {
            secret,
            public,
            node_id,
        }
    }

    /// Builds a key pair from 32 raw secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        Ok(Self::from_secret(SecretKey::from_slice(bytes)?))
    }

    /// Builds a key pair from a hex-encoded secret key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let mut bytes = hex::decode(s)?;
        let result = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        result
    }

    /// Returns the derived node identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Returns the compressed public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public.serialize()
    }

    /// Returns the secret key as hex, for identity-file persistence.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// Signs a 32-byte digest with the compact recoverable encoding.
    pub fn sign(&self, digest: &[u8; 32]) -> [u8; COMPACT_SIGNATURE_SIZE] {
        sign_compact(&self.secret, digest)
    }

    /// Signs a 32-byte digest with DER encoding (bridge HTTP auth only).
    pub fn sign_der(&self, digest: &[u8; 32]) -> Vec<u8> {
        sign_der(&self.secret, digest)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({}, secret: [REDACTED])", self.node_id)
    }
}

/// Zeroizes the secret key material on drop.
impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        // Comparing public halves avoids touching secret bytes.
        self.public == other.public
    }
}

impl Eq for KeyPair {}
