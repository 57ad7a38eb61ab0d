//! Contacts and the `storj://` URI form.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use storj_core::{NodeId, ProtocolVersion, Timestamp};
use thiserror::Error;

/// Error parsing a `storj://` contact URI.
#[derive(Debug, Error)]
pub enum UriError {
    /// Missing `storj://` scheme prefix.
    #[error("Missing 'storj://' scheme prefix")]
    MissingScheme,

    /// Host or port component absent or malformed.
    #[error("Invalid authority component: {0}")]
    InvalidAuthority(String),

    /// Port is not a positive 16-bit integer.
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Node id path component absent or not 40 hex characters.
    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),
}

/// A known peer on the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Reachable host name or IP address.
    pub address: String,
    /// Reachable port.
    pub port: u16,
    /// The peer's identity.
    pub node_id: NodeId,
    /// Advertised protocol version string.
    pub protocol: String,
    /// When this contact last showed activity.
    pub last_seen: Timestamp,
}

impl Contact {
    /// Creates a contact seen now.
    pub fn new(address: impl Into<String>, port: u16, node_id: NodeId) -> Self {
        Self {
            address: address.into(),
            port,
            node_id,
            protocol: storj_core::PROTOCOL_VERSION.to_string(),
            last_seen: Timestamp::now(),
        }
    }

    /// Renders the `storj://host:port/nodeid` URI.
    pub fn uri(&self) -> String {
        format!("storj://{}:{}/{}", self.address, self.port, self.node_id)
    }

    /// Parses a `storj://host:port/nodeid` URI.
    pub fn from_uri(s: &str) -> Result<Self, UriError> {
        let rest = s.strip_prefix("storj://").ok_or(UriError::MissingScheme)?;

        let (authority, id_part) = rest
            .split_once('/')
            .ok_or_else(|| UriError::InvalidNodeId(String::new()))?;

        let (host, port_part) = authority
            .rsplit_once(':')
            .ok_or_else(|| UriError::InvalidAuthority(authority.to_string()))?;
        if host.is_empty() {
            return Err(UriError::InvalidAuthority(authority.to_string()));
        }

        let port: u16 = port_part
            .parse()
            .map_err(|_| UriError::InvalidPort(port_part.to_string()))?;
        if port == 0 {
            return Err(UriError::InvalidPort(port_part.to_string()));
        }

        let node_id =
            NodeId::from_hex(id_part).map_err(|_| UriError::InvalidNodeId(id_part.to_string()))?;

        Ok(Self::new(host, port, node_id))
    }

    /// Returns the dialable `host:port` form.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Returns true when the contact is dialable.
    ///
    /// Loopback addresses are rejected unless explicitly allowed; a zero
    /// port is never valid.
    pub fn is_valid(&self, allow_loopback: bool) -> bool {
        if self.port == 0 || self.address.is_empty() {
            return false;
        }
        if allow_loopback {
            return true;
        }
        if self.address.eq_ignore_ascii_case("localhost") {
            return false;
        }
        match IpAddr::from_str(&self.address) {
            Ok(ip) => !ip.is_loopback(),
            // Host names other than localhost pass; resolution decides later.
            Err(_) => true,
        }
    }

    /// Marks the contact as active now.
    pub fn touch(&mut self) {
        self.last_seen = Timestamp::now();
    }

    /// Returns true when the contact speaks a compatible protocol.
    pub fn is_compatible(&self, ours: &ProtocolVersion) -> bool {
        ours.is_compatible_str(&self.protocol)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storj_core::KeyPair;

    fn contact() -> Contact {
        Contact::new("203.0.113.10", 4000, *KeyPair::generate().node_id())
    }

    #[test]
    fn test_uri_roundtrip() {
        let original = contact();
        let parsed = Contact::from_uri(&original.uri()).unwrap();
        assert_eq!(parsed.address, original.address);
        assert_eq!(parsed.port, original.port);
        assert_eq!(parsed.node_id, original.node_id);
    }

    #[test]
    fn test_bad_uris_rejected() {
        assert!(matches!(
            Contact::from_uri("http://a:1/b"),
            Err(UriError::MissingScheme)
        ));
        assert!(matches!(
            Contact::from_uri("storj://hostonly/abcd"),
            Err(UriError::InvalidAuthority(_))
        ));
        assert!(matches!(
            Contact::from_uri("storj://host:0/0000000000000000000000000000000000000000"),
            Err(UriError::InvalidPort(_))
        ));
        assert!(matches!(
            Contact::from_uri("storj://host:80/nothex"),
            Err(UriError::InvalidNodeId(_))
        ));
    }

    #[test]
    fn test_loopback_validity() {
        let mut c = contact();
        assert!(c.is_valid(false));

        c.address = "127.0.0.1".to_string();
        assert!(!c.is_valid(false));
        assert!(c.is_valid(true));

        c.address = "localhost".to_string();
        assert!(!c.is_valid(false));

        c.address = "::1".to_string();
        assert!(!c.is_valid(false));
    }

    #[test]
    fn test_zero_port_invalid() {
        let mut c = contact();
        c.port = 0;
        assert!(!c.is_valid(true));
    }

    #[test]
    fn test_protocol_compatibility() {
        let ours = ProtocolVersion::current();
        let mut c = contact();
        assert!(c.is_compatible(&ours));

        c.protocol = "999.0.0".to_string();
        assert!(!c.is_compatible(&ours));

        c.protocol = format!("{}-custom", storj_core::PROTOCOL_VERSION);
        assert!(!c.is_compatible(&ours));
    }
}
