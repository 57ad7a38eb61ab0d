//! In-memory storage adapter: two maps, keys → items and keys → bytes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use storj_core::ShardHash;

use crate::shard::{BufferSource, ShardRead, ShardWrite};
use crate::{StorageAdapter, StorageItem, StoreError};

/// Volatile adapter for tests and short-lived nodes.
#[derive(Default)]
pub struct MemoryAdapter {
    items: RwLock<HashMap<ShardHash, StorageItem>>,
    shards: Arc<RwLock<HashMap<ShardHash, Bytes>>>,
}

impl MemoryAdapter {
    /// Creates an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn get(&self, key: &ShardHash) -> Result<StorageItem, StoreError> {
        let has_shard = self.shards.read().contains_key(key);
        let item = self.items.read().get(key).cloned();

        match item {
            Some(mut item) => {
                item.has_shard = has_shard;
                Ok(item)
            }
            None if has_shard => {
                let mut item = StorageItem::new(*key);
                item.has_shard = true;
                Ok(item)
            }
            None => Err(StoreError::NotFound(key.to_hex())),
        }
    }

    async fn peek(&self, key: &ShardHash) -> Result<StorageItem, StoreError> {
        self.items
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_hex()))
    }

    async fn put(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        if item.hash != *key {
            return Err(StoreError::KeyMismatch);
        }
        let mut items = self.items.write();
        match items.get_mut(key) {
            Some(held) => held.merge(item),
            None => {
                items.insert(*key, item);
            }
        }
        Ok(())
    }

    async fn replace(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        if item.hash != *key {
            return Err(StoreError::KeyMismatch);
        }
        self.items.write().insert(*key, item);
        Ok(())
    }

    async fn del(&self, key: &ShardHash) -> Result<(), StoreError> {
        self.shards.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ShardHash>, StoreError> {
        let mut keys: Vec<ShardHash> = self.items.read().keys().copied().collect();
        for key in self.shards.read().keys() {
            if !keys.contains(key) {
                keys.push(*key);
            }
        }
        Ok(keys)
    }

    async fn size(&self) -> Result<u64, StoreError> {
        Ok(self.shards.read().values().map(|b| b.len() as u64).sum())
    }

    async fn has_shard(&self, key: &ShardHash) -> Result<bool, StoreError> {
        Ok(self.shards.read().contains_key(key))
    }

    async fn open_source(&self, key: &ShardHash) -> Result<Box<dyn ShardRead>, StoreError> {
        let data = self
            .shards
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::ShardMissing(key.to_hex()))?;
        Ok(Box::new(BufferSource::new(data)))
    }

    async fn open_sink(&self, key: &ShardHash) -> Result<Box<dyn ShardWrite>, StoreError> {
        Ok(Box::new(MemorySink {
            key: *key,
            shards: Arc::clone(&self.shards),
            buf: Vec::new(),
        }))
    }
}

struct MemorySink {
    key: ShardHash,
    shards: Arc<RwLock<HashMap<ShardHash, Bytes>>>,
    buf: Vec<u8>,
}

#[async_trait]
impl ShardWrite for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.shards.write().insert(self.key, Bytes::from(self.buf));
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
