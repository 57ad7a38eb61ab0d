//! Shard byte streams.
//!
//! Shards move as pull-based streams: a source yields chunks until `None`,
//! a sink accepts chunks and only publishes the bytes on commit. Aborting a
//! sink leaves no trace.

use async_trait::async_trait;
use bytes::Bytes;

use crate::StoreError;

/// Chunk size for in-memory and KV-backed sources.
pub(crate) const SOURCE_CHUNK: usize = 64 * 1024;

/// Readable shard byte stream.
#[async_trait]
pub trait ShardRead: Send {
    /// Pulls the next chunk, or `None` at end of shard.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError>;
}

/// Writable shard byte sink.
#[async_trait]
pub trait ShardWrite: Send {
    /// Appends a chunk.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError>;

    /// Publishes the accumulated bytes under the sink's key.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discards the accumulated bytes.
    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// A source over bytes already in memory, used by the memory and KV
/// adapters.
pub(crate) struct BufferSource {
    data: Bytes,
    pos: usize,
}

impl BufferSource {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }
}

#[async_trait]
impl ShardRead for BufferSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + SOURCE_CHUNK).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(Some(chunk))
    }
}

/// Drains a source to a vector; test and small-shard helper.
pub async fn read_all(source: &mut dyn ShardRead) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    while let Some(chunk) = source.next_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
