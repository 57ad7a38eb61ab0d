//! Core types, traits, and primitives for the storj node.
//!
//! This crate provides:
//! - Cryptographic primitives (SHA-256, RIPEMD160(SHA256), secp256k1 ECDSA)
//! - Identifier types (NodeId, ShardHash: 20-byte hash160 digests)
//! - Key pairs and compact recoverable signing
//! - Timestamps (unix milliseconds)
//! - Protocol version compatibility rules
//! - Runtime configuration assembled once at start-up

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod identifiers;
pub mod keys;
pub mod time;
pub mod version;

pub use config::Config;
pub use crypto::*;
pub use identifiers::*;
pub use keys::*;
pub use time::*;
pub use version::*;

/// Window within which an RPC nonce is accepted (5 minutes).
pub const NONCE_EXPIRE_MS: i64 = 300_000;

/// Lifetime of a data-channel token (5 minutes).
pub const TOKEN_TTL_MS: i64 = 300_000;

/// Default response timeout for a single RPC round trip.
pub const RESPONSE_TIMEOUT_MS: u64 = 5_000;

/// Default shard size for the file demuxer (8 MiB).
pub const DEFAULT_SHARD_SIZE: u64 = 8 * 1024 * 1024;

/// Number of bytes in an audit challenge nonce.
pub const CHALLENGE_SIZE: usize = 16;

/// Number of bytes in a data-channel token / RPC message id (160 bits).
pub const TOKEN_SIZE: usize = 20;
