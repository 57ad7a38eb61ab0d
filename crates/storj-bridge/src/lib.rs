//! Client for the bridge REST API.
//!
//! The bridge is an external coordination service holding user accounts,
//! buckets, frames, and file metadata; the node only consumes its HTTP
//! surface. Authentication is either HTTP basic (email plus SHA-256 of the
//! password) or ECDSA: sign `METHOD\nPATH\nPAYLOAD` with the node key and
//! send the public key and DER signature in headers.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod client;
mod retry;

pub use client::{BridgeAuth, BridgeClient, BridgeFrame, BucketInfo, FileEntry, ShardEntry};
pub use retry::retry;

use thiserror::Error;

/// Errors from bridge interactions.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge answered with a non-success status.
    #[error("Bridge returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// Response body failed to parse.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
