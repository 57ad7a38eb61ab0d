//! Identifier types.
//!
//! Every identity and content address on the overlay is a 20-byte
//! RIPEMD160(SHA256(·)) digest, rendered as 40 hex characters on the wire:
//! - `NodeId` - hash160 of a node's compressed public key
//! - `ShardHash` - hash160 of a shard's bytes
//! - `ContractId` - hash160 of a contract's canonical form

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::hash160;

/// Macro to define a 20-byte hash identifier with common implementations.
macro_rules! define_hash_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; 20]);

        impl $name {
            /// Creates a new identifier from a 20-byte array.
            pub const fn new(bytes: [u8; 20]) -> Self {
                Self(bytes)
            }

            /// Creates a zero identifier.
            pub const fn zero() -> Self {
                Self([0u8; 20])
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; 20] {
                &self.0
            }

            /// Returns the inner bytes as a slice.
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// Parses a 40-character hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 20 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 20];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Returns the 40-character hex rendering.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Computes XOR distance for Kademlia routing.
            pub fn xor_distance(&self, other: &Self) -> [u8; 20] {
                let mut result = [0u8; 20];
                for i in 0..20 {
                    result[i] = self.0[i] ^ other.0[i];
                }
                result
            }

            /// Returns the leading zero bits count (for k-bucket indexing).
            pub fn leading_zeros(&self) -> u32 {
                let mut zeros = 0u32;
                for byte in &self.0 {
                    if *byte == 0 {
                        zeros += 8;
                    } else {
                        zeros += byte.leading_zeros();
                        break;
                    }
                }
                zeros
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; 20]> for $name {
            fn from(bytes: [u8; 20]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; 20] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        // Hex-string serde: these identifiers appear in wire JSON, both as
        // values and as map keys.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct HexVisitor;

                impl<'de> Visitor<'de> for HexVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "a 40-character hex string")
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        $name::from_hex(v).map_err(|e| E::custom(e))
                    }
                }

                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

define_hash_type!(
    /// Node identity: hash160 of the node's compressed secp256k1 public key.
    NodeId
);

define_hash_type!(
    /// Content address of a shard: hash160 of the shard bytes.
    ShardHash
);

define_hash_type!(
    /// Identity of a storage contract: hash160 of its canonical form.
    ContractId
);

impl NodeId {
    /// Derives a NodeId from a compressed public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(hash160(public_key))
    }
}

impl ShardHash {
    /// Computes the content address of a byte sequence.
    pub fn of(data: &[u8]) -> Self {
        Self(hash160(data))
    }
}

/// Returns true if the string is a well-formed 40-hex shard key.
pub fn is_hash_key(key: &str) -> bool {
    key.len() == 40 && key.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = ShardHash::of(b"hello storj");
        let parsed = ShardHash::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn test_xor_distance() {
        let a = NodeId::new([0xFF; 20]);
        let b = NodeId::new([0x00; 20]);
        assert_eq!(a.xor_distance(&b), [0xFF; 20]);
        assert_eq!(a.xor_distance(&a), [0x00; 20]);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(NodeId::new([0x00; 20]).leading_zeros(), 160);

        let mut bytes = [0x00; 20];
        bytes[0] = 0x80;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 0);

        bytes[0] = 0x01;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 7);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = ShardHash::of(b"payload");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));

        let back: ShardHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_is_hash_key() {
        let id = ShardHash::of(b"x");
        assert!(is_hash_key(&id.to_hex()));
        assert!(!is_hash_key("not-a-key"));
        assert!(!is_hash_key(&"a".repeat(39)));
    }
}
