//! Shard storage.
//!
//! This crate defines:
//! - [`StorageItem`]: per-shard metadata: contracts, audit leaves,
//!   challenges, and free-form meta, each keyed by counterparty node
//! - [`StorageAdapter`]: the abstract async key→(item, shard-bytes) store
//! - Three adapter variants: in-memory, embedded-KV (rocksdb), filesystem
//! - [`ShardManager`]: policy layer: capacity limits, per-key write
//!   serialization, expired-contract reaping

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod fs;
mod item;
mod kv;
mod manager;
mod memory;
mod shard;

pub use fs::FsAdapter;
pub use item::StorageItem;
pub use kv::KvAdapter;
pub use manager::{ManagedSink, ShardManager};
pub use memory::MemoryAdapter;
pub use shard::{read_all, ShardRead, ShardWrite};

use async_trait::async_trait;
use storj_core::ShardHash;
use thiserror::Error;

/// Errors from storage adapters and the shard manager.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under the key.
    #[error("Shard not found: {0}")]
    NotFound(String),

    /// Shard bytes are awaited but not yet present.
    #[error("Shard bytes not present: {0}")]
    ShardMissing(String),

    /// The key does not equal the item's hash.
    #[error("Key does not match item hash")]
    KeyMismatch,

    /// Capacity limit would be exceeded.
    #[error("Storage capacity exceeded")]
    StorageFull,

    /// A write is already in flight for the key.
    #[error("Concurrent write in progress for {0}")]
    WriteInProgress(String),

    /// Embedded database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Persisted data failed to parse.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Abstract key→(item, shard-bytes) store.
///
/// Keys are shard content hashes. `put` is an idempotent merge: metadata
/// maps are unioned per counterparty, never dropped. Implementations must
/// serialize concurrent writes to the same key; concurrent reads are free.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Loads the item under the key, with shard presence resolved.
    ///
    /// Fails `NotFound` when neither metadata nor shard bytes exist.
    async fn get(&self, key: &ShardHash) -> Result<StorageItem, StoreError>;

    /// Loads the item's metadata without touching shard bytes.
    async fn peek(&self, key: &ShardHash) -> Result<StorageItem, StoreError>;

    /// Merges the item into the store under the key.
    ///
    /// Rejects a key that does not match the item's own hash.
    async fn put(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError>;

    /// Replaces the stored item outright, no merge.
    ///
    /// Maintenance uses this to persist reductions (reaped counterparties)
    /// that the merging `put` cannot express.
    async fn replace(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError>;

    /// Removes the shard bytes; metadata is retained.
    async fn del(&self, key: &ShardHash) -> Result<(), StoreError>;

    /// Lists stored keys (40-hex shard hashes only).
    async fn keys(&self) -> Result<Vec<ShardHash>, StoreError>;

    /// Returns total shard bytes held.
    async fn size(&self) -> Result<u64, StoreError>;

    /// Returns true when the shard bytes are present.
    async fn has_shard(&self, key: &ShardHash) -> Result<bool, StoreError>;

    /// Opens a readable stream over the shard bytes.
    async fn open_source(&self, key: &ShardHash) -> Result<Box<dyn ShardRead>, StoreError>;

    /// Opens a writable sink for the shard bytes.
    ///
    /// Nothing is visible under the key until the sink commits.
    async fn open_sink(&self, key: &ShardHash) -> Result<Box<dyn ShardWrite>, StoreError>;
}
