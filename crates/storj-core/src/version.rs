//! Protocol version compatibility.
//!
//! Two nodes speak the same protocol when their versions agree on major,
//! minor, AND build tag; only the patch component may differ. Contacts
//! advertising an unparseable version are incompatible with everyone and
//! get dropped by the routing-table cleaner.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The protocol version this node speaks.
pub const PROTOCOL_VERSION: &str = "1.2.0";

/// Error parsing a version string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid protocol version: {0}")]
pub struct VersionParseError(pub String);

/// A semantic protocol version with an optional build tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
    /// Pre-release / build tag, if any.
    pub tag: Option<String>,
}

impl ProtocolVersion {
    /// Returns the version this node runs.
    pub fn current() -> Self {
        PROTOCOL_VERSION
            .parse()
            .expect("PROTOCOL_VERSION constant is well-formed")
    }

    /// Returns true if a peer at `other` can interoperate with this node.
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor && self.tag == other.tag
    }

    /// Parses and checks a peer's advertised version string.
    ///
    /// Unparseable strings are incompatible.
    pub fn is_compatible_str(&self, other: &str) -> bool {
        other
            .parse::<ProtocolVersion>()
            .map(|v| self.is_compatible(&v))
            .unwrap_or(false)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError(s.to_string());

        let (numbers, tag) = match s.split_once('-') {
            Some((n, t)) if !t.is_empty() => (n, Some(t.to_string())),
            Some(_) => return Err(err()),
            None => (s, None),
        };

        let mut parts = numbers.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let patch = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        if parts.next().is_some() {
            return Err(err());
        }

        Ok(Self {
            major,
            minor,
            patch,
            tag,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(tag) = &self.tag {
            write!(f, "-{}", tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let v: ProtocolVersion = "1.2.3".parse().unwrap();
        assert_eq!(v.to_string(), "1.2.3");

        let tagged: ProtocolVersion = "1.2.3-beta".parse().unwrap();
        assert_eq!(tagged.tag.as_deref(), Some("beta"));
        assert_eq!(tagged.to_string(), "1.2.3-beta");
    }

    #[test]
    fn test_patch_differs_still_compatible() {
        let a: ProtocolVersion = "1.2.0".parse().unwrap();
        let b: ProtocolVersion = "1.2.9".parse().unwrap();
        assert!(a.is_compatible(&b));
    }

    #[test]
    fn test_minor_or_major_mismatch_incompatible() {
        let a: ProtocolVersion = "1.2.0".parse().unwrap();
        assert!(!a.is_compatible(&"1.3.0".parse().unwrap()));
        assert!(!a.is_compatible(&"2.2.0".parse().unwrap()));
    }

    #[test]
    fn test_tag_mismatch_incompatible() {
        let a: ProtocolVersion = "1.2.0".parse().unwrap();
        assert!(!a.is_compatible(&"1.2.0-rc1".parse().unwrap()));

        let b: ProtocolVersion = "1.2.0-rc1".parse().unwrap();
        assert!(b.is_compatible(&"1.2.5-rc1".parse().unwrap()));
    }

    #[test]
    fn test_garbage_incompatible() {
        let current = ProtocolVersion::current();
        assert!(!current.is_compatible_str("999"));
        assert!(!current.is_compatible_str("not a version"));
        assert!(!current.is_compatible_str(""));
        assert!(current.is_compatible_str(PROTOCOL_VERSION));
    }
}
