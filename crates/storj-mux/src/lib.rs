//! Deterministic file sharding and ordered reassembly.
//!
//! The demuxer splits a byte source into fixed-size shards with ascending
//! indices; the muxer drains a set of shard sources strictly in index order
//! and reproduces the original byte stream. Both are pull-based: a caller
//! asks for the next chunk and nothing is buffered beyond one read.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod demux;
mod mux;

pub use demux::{FileDemuxer, Shard};
pub use mux::{FileMuxer, MuxerOptions};

use thiserror::Error;

/// Errors from sharding and reassembly.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Shard count missing or not a positive integer.
    #[error("Cannot multiplex a 0 shard stream")]
    InvalidShardCount,

    /// Length parameter missing.
    #[error("You must supply a length parameter")]
    MissingLength,

    /// Length parameter present but not a positive integer.
    #[error("Length must be a positive integer")]
    InvalidLength,

    /// Shard size must be positive.
    #[error("Shard size must be positive")]
    InvalidShardSize,

    /// More inputs registered than the declared shard count.
    #[error("Inputs exceed the declared number of shards")]
    TooManyInputs,

    /// Inputs delivered more bytes than the declared length.
    #[error("Input exceeds the declared length")]
    LengthExceeded,

    /// Read attempted with no input available, or inputs ended short.
    #[error("Unexpected end of source stream")]
    UnexpectedEnd,

    /// Growth must add at least one shard.
    #[error("Cannot grow by zero shards")]
    InvalidGrowth,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
