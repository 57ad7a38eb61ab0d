//! Opcode topics for the publish/subscribe contract market.
//!
//! A topic is 3 bytes rendered as 6 hex characters. Byte 0 is the category;
//! bytes 1–2 describe the publication so farmers can subscribe to exactly
//! the contract shapes they can serve.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category byte for data storage contract publications.
pub const PREFIX_CONTRACT: u8 = 0x0F;

/// Category byte for tunneler availability announcements.
pub const PREFIX_TUNNELER: u8 = 0x0E;

/// A 3-byte opcode topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(pub [u8; 3]);

impl Topic {
    /// Creates a topic from its raw bytes.
    pub const fn new(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    /// Parses the 6-character hex rendering.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 3 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    /// Returns the 6-character hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the category byte.
    pub fn category(&self) -> u8 {
        self.0[0]
    }

    /// Returns the two descriptor bytes.
    pub fn descriptor(&self) -> [u8; 2] {
        [self.0[1], self.0[2]]
    }

    /// Returns true when the topic starts with the given byte pattern.
    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        prefix.len() <= 3 && self.0.starts_with(prefix)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.to_hex())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_hex()
    }
}

impl TryFrom<String> for Topic {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Topic::from_hex(&s)
    }
}

/// Shard-size classes for contract topic descriptors.
const SIZE_BUCKETS: [u64; 6] = [
    8 * 1024 * 1024,
    16 * 1024 * 1024,
    32 * 1024 * 1024,
    64 * 1024 * 1024,
    128 * 1024 * 1024,
    256 * 1024 * 1024,
];

/// Storage-duration classes (in milliseconds) for contract topics.
const DURATION_BUCKETS: [i64; 4] = [
    30 * 24 * 3600 * 1000,
    90 * 24 * 3600 * 1000,
    180 * 24 * 3600 * 1000,
    365 * 24 * 3600 * 1000,
];

/// Derives the market topic for a contract's shape.
///
/// Byte 1 buckets the shard size, byte 2 the storage duration; contracts
/// larger or longer than every bucket fall in the last one.
pub fn contract_topic(data_size: u64, duration_ms: i64) -> Topic {
    let size_class = SIZE_BUCKETS
        .iter()
        .position(|b| data_size <= *b)
        .unwrap_or(SIZE_BUCKETS.len() - 1) as u8;
    let duration_class = DURATION_BUCKETS
        .iter()
        .position(|b| duration_ms <= *b)
        .unwrap_or(DURATION_BUCKETS.len() - 1) as u8;

    Topic([PREFIX_CONTRACT, size_class, duration_class])
}

/// Tunneler availability topic: `available` selects the announce or
/// withdraw variant.
pub fn tunneler_topic(available: bool) -> Topic {
    Topic([PREFIX_TUNNELER, available as u8, 0x00])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let topic = Topic::new([0x0F, 0x01, 0x02]);
        assert_eq!(topic.to_hex(), "0f0102");
        assert_eq!(Topic::from_hex("0f0102").unwrap(), topic);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(Topic::from_hex("0f01").is_err());
        assert!(Topic::from_hex("zzzzzz").is_err());
    }

    #[test]
    fn test_contract_topic_buckets() {
        let month = 30 * 24 * 3600 * 1000;

        let small = contract_topic(1024, month);
        assert_eq!(small.category(), PREFIX_CONTRACT);
        assert_eq!(small.descriptor(), [0, 0]);

        let medium = contract_topic(20 * 1024 * 1024, 100 * 24 * 3600 * 1000);
        assert_eq!(medium.descriptor(), [2, 2]);

        // Oversized falls in the last bucket.
        let huge = contract_topic(u64::MAX, i64::MAX);
        assert_eq!(huge.descriptor(), [5, 3]);
    }

    #[test]
    fn test_tunneler_topics() {
        assert_eq!(tunneler_topic(true).0, [PREFIX_TUNNELER, 0x01, 0x00]);
        assert_eq!(tunneler_topic(false).0, [PREFIX_TUNNELER, 0x00, 0x00]);
    }

    #[test]
    fn test_prefix_matching() {
        let topic = tunneler_topic(true);
        assert!(topic.matches_prefix(&[PREFIX_TUNNELER]));
        assert!(topic.matches_prefix(&[PREFIX_TUNNELER, 0x01]));
        assert!(!topic.matches_prefix(&[PREFIX_CONTRACT]));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let topic = contract_topic(1, 1);
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, "\"0f0000\"");
        let back: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }
}
