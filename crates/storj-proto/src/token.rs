//! Data-channel tokens and control frames.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use storj_core::{ContractId, ShardHash, Timestamp};

use crate::random_hex_id;

/// Direction a token authorizes on a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Client streams shard bytes to the farmer.
    Push,
    /// Farmer streams shard bytes to the client.
    Pull,
}

/// An opaque credential authorizing one data-channel operation.
///
/// PUSH tokens are single-use; PULL tokens may be reused within their TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Random 160-bit value, hex encoded.
    pub value: String,
    /// The authorized operation.
    pub operation: Operation,
    /// Shard hash the token is scoped to.
    pub data_hash: ShardHash,
    /// Contract the token was issued under, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<ContractId>,
    /// Issue time.
    pub issued_at: Timestamp,
    /// Expiry time.
    pub expires_at: Timestamp,
}

impl Token {
    /// Issues a fresh token scoped to a shard for a TTL.
    pub fn issue(operation: Operation, data_hash: ShardHash, ttl: Duration) -> Self {
        let issued_at = Timestamp::now();
        Self {
            value: random_hex_id(),
            operation,
            data_hash,
            contract_id: None,
            issued_at,
            expires_at: issued_at.add(ttl),
        }
    }

    /// Binds the token to the contract it was issued under.
    pub fn for_contract(mut self, contract_id: ContractId) -> Self {
        self.contract_id = Some(contract_id);
        self
    }

    /// Returns true once the TTL has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_before(&now)
    }
}

/// The JSON control frame opening a data channel, sent before any bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFrame {
    /// Token value previously issued over RPC.
    pub token: String,
    /// Shard the transfer concerns; must match the token's scope.
    pub hash: ShardHash,
    /// Requested direction; must match the token's operation.
    pub operation: Operation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_shape() {
        let token = Token::issue(
            Operation::Push,
            ShardHash::of(b"shard"),
            Duration::from_secs(300),
        );
        assert_eq!(token.value.len(), 40);
        assert_eq!(token.expires_at.as_millis() - token.issued_at.as_millis(), 300_000);
        assert!(!token.is_expired(Timestamp::now()));
    }

    #[test]
    fn test_expiry() {
        let token = Token::issue(
            Operation::Pull,
            ShardHash::of(b"shard"),
            Duration::from_millis(10),
        );
        assert!(token.is_expired(token.expires_at.add(Duration::from_millis(1))));
    }

    #[test]
    fn test_contract_binding() {
        let token = Token::issue(
            Operation::Pull,
            ShardHash::of(b"shard"),
            Duration::from_secs(300),
        );
        assert!(token.contract_id.is_none());

        let id = ContractId::new([7u8; 20]);
        let bound = token.for_contract(id);
        assert_eq!(bound.contract_id, Some(id));

        let json = serde_json::to_string(&bound).unwrap();
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back.contract_id, Some(id));
    }

    #[test]
    fn test_operation_wire_names() {
        assert_eq!(serde_json::to_string(&Operation::Push).unwrap(), "\"PUSH\"");
        assert_eq!(serde_json::to_string(&Operation::Pull).unwrap(), "\"PULL\"");
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = ChannelFrame {
            token: random_hex_id(),
            hash: ShardHash::of(b"shard"),
            operation: Operation::Push,
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ChannelFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token, frame.token);
        assert_eq!(back.operation, Operation::Push);
    }
}
