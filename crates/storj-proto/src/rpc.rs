//! Signed RPC message envelope.
//!
//! Requests and responses share one JSON shape: `{id, method, params}` for
//! requests, `{id, result}` for responses. Every params/result object carries
//! the sender's contact, a millisecond nonce, and a compact ECDSA signature
//! over `sha256(message_id || nonce)`, so any message can be attributed to a
//! node identity without a prior handshake.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storj_audit::{Challenge, ProofNode};
use storj_core::{recover_compact, sha256, KeyPair, NodeId, ShardHash, Timestamp};

use crate::contact::Contact;
use crate::contract::Contract;
use crate::{random_hex_id, ProtoError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// The RPC method set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcMethod {
    /// Ask the recipient to probe the sender's reachability.
    Probe,
    /// Kademlia node lookup.
    FindNode,
    /// Kademlia value lookup.
    FindValue,
    /// Kademlia record store.
    Store,
    /// Liveness check.
    Ping,
    /// Farmer offers on a published contract.
    Offer,
    /// Renter consigns a shard and its audit leaves to a farmer.
    Consign,
    /// Renter requests a shard back.
    Retrieve,
    /// Renter challenges a farmer to prove retention.
    Audit,
    /// Renter instructs a farmer to replicate from another farmer.
    Mirror,
    /// Ask for known tunneler contacts.
    FindTunnel,
    /// Request a relay slot from a tunneler.
    OpenTunnel,
    /// Publish to an opcode topic.
    Publish,
    /// Subscribe to opcode topics.
    Subscribe,
}

impl RpcMethod {
    /// Methods accepted from contacts that cannot be verified yet, because
    /// they are part of establishing verifiability.
    pub fn is_exempt(&self) -> bool {
        matches!(
            self,
            RpcMethod::Probe | RpcMethod::FindTunnel | RpcMethod::OpenTunnel
        )
    }
}

/// Request or response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcBody {
    /// A request: method plus parameters.
    Request {
        /// The invoked method.
        method: RpcMethod,
        /// Method parameters, including the envelope fields.
        params: Value,
    },
    /// A response: result only.
    Response {
        /// Result object, including the envelope fields.
        result: Value,
    },
}

/// One RPC message, request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Random 160-bit message id, hex; responses echo the request's id.
    pub id: String,
    /// Request or response payload.
    #[serde(flatten)]
    pub body: RpcBody,
}

impl RpcMessage {
    /// Creates a request with a fresh message id.
    pub fn request(method: RpcMethod, params: Value) -> Self {
        Self {
            id: random_hex_id(),
            body: RpcBody::Request { method, params },
        }
    }

    /// Creates a response to the given request id.
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            body: RpcBody::Response { result },
        }
    }

    /// Creates an error response carrying a message.
    pub fn error_response(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::response(id, serde_json::json!({ "error": message.into() }))
    }

    /// Returns the method for requests.
    pub fn method(&self) -> Option<RpcMethod> {
        match &self.body {
            RpcBody::Request { method, .. } => Some(*method),
            RpcBody::Response { .. } => None,
        }
    }

    /// Returns the params or result object.
    pub fn payload(&self) -> &Value {
        match &self.body {
            RpcBody::Request { params, .. } => params,
            RpcBody::Response { result } => result,
        }
    }

    /// Returns a mutable reference to the params or result object.
    pub fn payload_mut(&mut self) -> &mut Value {
        match &mut self.body {
            RpcBody::Request { params, .. } => params,
            RpcBody::Response { result } => result,
        }
    }

    /// Returns the error message, if this is an error response.
    pub fn error_message(&self) -> Option<&str> {
        match &self.body {
            RpcBody::Response { result } => result.get("error").and_then(Value::as_str),
            RpcBody::Request { .. } => None,
        }
    }

    /// Deserializes the payload into a typed params/result struct.
    pub fn typed_payload<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        Ok(serde_json::from_value(self.payload().clone())?)
    }

    /// Stamps the envelope fields into the payload object.
    pub fn stamp(&mut self, keypair: &KeyPair, contact: &Contact) -> Result<(), ProtoError> {
        let envelope = Envelope::stamp(keypair, contact.clone(), &self.id);
        let fields = serde_json::to_value(&envelope)?;

        let payload = self.payload_mut();
        if payload.is_null() {
            *payload = serde_json::json!({});
        }
        if let (Some(target), Some(source)) = (payload.as_object_mut(), fields.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Extracts the envelope fields from the payload object.
    pub fn envelope(&self) -> Result<Envelope, ProtoError> {
        Ok(serde_json::from_value(self.payload().clone())?)
    }
}

/// Envelope fields present on every params/result object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender's claimed contact.
    pub contact: Contact,
    /// Sender's clock at signing, unix milliseconds.
    pub nonce: Timestamp,
    /// Base64 compact ECDSA over `sha256(message_id || nonce)`.
    pub signature: String,
}

impl Envelope {
    /// Signs a fresh envelope for a message id.
    pub fn stamp(keypair: &KeyPair, contact: Contact, message_id: &str) -> Self {
        let nonce = Timestamp::now();
        Self {
            contact,
            nonce,
            signature: sign_envelope(keypair, message_id, nonce),
        }
    }
}

/// Signs `sha256(message_id || nonce)`, returning base64.
pub fn sign_envelope(keypair: &KeyPair, message_id: &str, nonce: Timestamp) -> String {
    let digest = envelope_digest(message_id, nonce);
    BASE64.encode(keypair.sign(&digest))
}

/// Verifies an envelope: the nonce is fresh and the signature recovers to
/// the claimed contact's identity.
pub fn verify_envelope(
    message_id: &str,
    envelope: &Envelope,
    nonce_expire: Duration,
) -> Result<(), ProtoError> {
    // Rule is `now - nonce < expire`; a nonce from a slightly-ahead clock
    // has negative age and passes.
    let age = envelope.nonce.age_millis();
    if age >= nonce_expire.as_millis() as i64 {
        return Err(ProtoError::NonceExpired);
    }

    let bytes = BASE64
        .decode(&envelope.signature)
        .map_err(|_| ProtoError::SignatureEncoding)?;
    let digest = envelope_digest(message_id, envelope.nonce);
    let public = recover_compact(&digest, &bytes)?;

    if NodeId::from_public_key(&public.serialize()) != envelope.contact.node_id {
        return Err(ProtoError::IdentityMismatch);
    }
    Ok(())
}

fn envelope_digest(message_id: &str, nonce: Timestamp) -> [u8; 32] {
    let mut preimage = message_id.as_bytes().to_vec();
    preimage.extend_from_slice(nonce.as_millis().to_string().as_bytes());
    sha256(&preimage)
}

// Typed method bodies. Envelope fields ride alongside these in the same
// JSON object; serde ignores them on extraction.

/// OFFER request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferParams {
    /// The farmer-signed contract.
    pub contract: Contract,
}

/// OFFER response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResult {
    /// The completed, renter-countersigned contract.
    pub contract: Contract,
}

/// CONSIGN request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsignParams {
    /// Shard the consignment concerns.
    pub data_hash: ShardHash,
    /// Public audit leaves, hex encoded.
    pub audit_tree: Vec<String>,
}

/// CONSIGN response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsignResult {
    /// Single-use PUSH token for the data channel.
    pub token: String,
}

/// RETRIEVE request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveParams {
    /// Shard to retrieve.
    pub data_hash: ShardHash,
}

/// RETRIEVE response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResult {
    /// PULL token for the data channel.
    pub token: String,
}

/// AUDIT request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditParams {
    /// Shard under audit.
    pub data_hash: ShardHash,
    /// The challenge to answer.
    pub challenge: Challenge,
}

/// AUDIT response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    /// Authentication path to the audit tree root.
    pub proof: ProofNode,
}

/// MIRROR request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorParams {
    /// Shard to replicate.
    pub data_hash: ShardHash,
    /// PULL token valid at the source farmer.
    pub token: String,
    /// The source farmer to pull from.
    pub farmer: Contact,
}

/// PROBE response body (empty on success).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {}

/// FIND_TUNNEL response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindTunnelResult {
    /// Known tunneler contacts, best first.
    pub tunnels: Vec<Contact>,
}

/// OPEN_TUNNEL response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTunnelResult {
    /// Relay endpoint the client keeps open.
    pub tunnel: String,
    /// Public contact the client advertises while tunnelled.
    pub alias: Contact,
}

/// PUBLISH request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishParams {
    /// Unique publication id for routing loop suppression.
    pub uuid: String,
    /// Opcode topic, 6 hex characters.
    pub topic: String,
    /// Publication contents.
    pub contents: Value,
}
