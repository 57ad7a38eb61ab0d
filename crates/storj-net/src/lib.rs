//! Overlay participation.
//!
//! This crate wires a node onto the network:
//! - Signed RPC transport with per-contact rate limiting
//! - Kademlia-style routing table with protocol-hygiene cleaning
//! - Data channels for shard transfer, authenticated by single-use tokens
//! - Protocol handlers (OFFER, CONSIGN, RETRIEVE, AUDIT, MIRROR, PROBE,
//!   FIND_TUNNEL, OPEN_TUNNEL)
//! - The publish/subscribe contract market glue
//! - Tunnel client and server for NAT-bound peers
//! - The network facade: join/leave lifecycle, cleaner, reentry timer

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod channel;
pub mod handlers;
pub mod limiter;
pub mod market;
pub mod network;
pub mod overlay;
pub mod routing;
pub mod transport;
pub mod tunnel;

pub use channel::{ChannelError, DataChannelClient, DataChannelServer, TokenStore};
pub use handlers::Protocols;
pub use limiter::RateLimiter;
pub use market::Market;
pub use network::{Network, NetworkOptions};
pub use overlay::{LocalOverlay, Overlay, Publication};
pub use routing::{RoutingTable, TunnelerBucket};
pub use transport::{Dispatcher, RpcServer, RpcTransport, TcpRpcTransport};
pub use tunnel::{TunnelClient, TunnelEvent, TunnelServer};

use thiserror::Error;

/// Bucket size (k) for the routing table and tunneler bucket.
pub const DEFAULT_K: usize = 20;

/// Errors from overlay participation.
#[derive(Debug, Error)]
pub enum NetError {
    /// Protocol document failure (contract, envelope, serialization).
    #[error(transparent)]
    Proto(#[from] storj_proto::ProtoError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] storj_store::StoreError),

    /// Audit failure.
    #[error(transparent)]
    Audit(#[from] storj_audit::AuditError),

    /// Data channel failure.
    #[error(transparent)]
    Channel(#[from] channel::ChannelError),

    /// The peer answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// No response within the deadline.
    #[error("Response timeout")]
    Timeout,

    /// No farmer offered on a publication in time.
    #[error("No offer received for publication")]
    NoOffer,

    /// A later offer arrived after the publication was matched.
    #[error("Contract already matched")]
    ContractAlreadyMatched,

    /// The offer does not correspond to any pending publication.
    #[error("No pending publication for offer")]
    UnknownPublication,

    /// Every seed failed during join.
    #[error("No seed reachable")]
    NoSeedsReachable,

    /// No tunneler accepted a relay request.
    #[error("No tunnel available")]
    NoTunnelAvailable,

    /// Network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON framing failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
