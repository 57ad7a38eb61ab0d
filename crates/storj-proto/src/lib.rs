//! Wire protocol and message definitions.
//!
//! This crate defines everything that crosses a trust boundary:
//! - Contracts (canonical JSON, two-party compact ECDSA signing)
//! - Contacts and the `storj://` URI form
//! - The signed RPC message envelope and method set
//! - Opcode topics for the publish/subscribe contract market
//! - Data-channel tokens and control frames

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod contact;
pub mod contract;
pub mod rpc;
pub mod token;
pub mod topics;

pub use contact::{Contact, UriError};
pub use contract::{Contract, ContractBuilder, Role};
pub use rpc::{
    sign_envelope, verify_envelope, AuditParams, AuditResult, ConsignParams, ConsignResult,
    Envelope, FindTunnelResult, MirrorParams, OfferParams, OfferResult, OpenTunnelResult,
    ProbeResult, PublishParams, RetrieveParams, RetrieveResult, RpcBody, RpcMessage, RpcMethod,
};
pub use token::{ChannelFrame, Operation, Token};
pub use topics::{contract_topic, tunneler_topic, Topic, PREFIX_CONTRACT, PREFIX_TUNNELER};

use thiserror::Error;

/// Generates a random 160-bit identifier, hex encoded.
///
/// Used for RPC message ids and data-channel token values.
pub fn random_hex_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; storj_core::TOKEN_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Errors from protocol document handling.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A field required for the role is missing.
    #[error("Missing required contract field: {0}")]
    MissingField(&'static str),

    /// Contract time range is inverted or empty.
    #[error("Contract store_end must be after store_begin")]
    InvalidTimeRange,

    /// Contract data size must be positive.
    #[error("Contract data_size must be positive")]
    InvalidDataSize,

    /// Mutation attempted on a signed contract.
    #[error("Contract is signed and can no longer be modified")]
    ContractFrozen,

    /// The role has already signed this contract.
    #[error("Contract already carries a {0} signature")]
    AlreadySigned(Role),

    /// No signature present for the role.
    #[error("Contract carries no {0} signature")]
    SignatureMissing(Role),

    /// Signature present but does not recover to the expected identity.
    #[error("Contract {0} signature does not match the expected node")]
    SignatureInvalid(Role),

    /// Signature bytes are not valid base64.
    #[error("Invalid signature encoding")]
    SignatureEncoding,

    /// Underlying crypto failure.
    #[error(transparent)]
    Signature(#[from] storj_core::SignatureError),

    /// Envelope nonce is outside the freshness window.
    #[error("Message nonce expired")]
    NonceExpired,

    /// Envelope signature recovers to a different node than claimed.
    #[error("Message signature does not match the sender's identity")]
    IdentityMismatch,

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
