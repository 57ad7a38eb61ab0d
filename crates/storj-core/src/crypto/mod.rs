//! Cryptographic primitives.
//!
//! The network uses a single hash construction everywhere content or
//! identity is addressed: `hash160(x) = RIPEMD160(SHA256(x))`, and compact
//! recoverable ECDSA over secp256k1 for every wire signature.

mod hash;
mod signature;

pub use hash::{hash160, sha256, Hash160Hasher};
pub use signature::{
    derive_public_key, generate_secret_key, recover_compact, sign_compact, sign_der,
    SignatureError, COMPACT_SIGNATURE_SIZE,
};

/// Size of a hash160 digest in bytes.
pub const HASH_SIZE: usize = 20;
