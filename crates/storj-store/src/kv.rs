//! Embedded-KV storage adapter over rocksdb.
//!
//! Item metadata and shard bytes live in separate column families keyed by
//! the raw 20-byte shard hash.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rocksdb::{IteratorMode, Options, DB};
use storj_core::ShardHash;
use tracing::debug;

use crate::shard::{BufferSource, ShardRead, ShardWrite};
use crate::{StorageAdapter, StorageItem, StoreError};

/// Column family for item metadata (JSON values).
const ITEM_CF: &str = "items";
/// Column family for raw shard bytes.
const SHARD_CF: &str = "shards";

/// Persistent adapter backed by an embedded rocksdb database.
pub struct KvAdapter {
    db: Arc<DB>,
}

impl KvAdapter {
    /// Opens (or creates) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, [ITEM_CF, SHARD_CF])
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Missing column family: {name}")))
    }

    fn load_item(&self, key: &ShardHash) -> Result<Option<StorageItem>, StoreError> {
        let cf = self.cf(ITEM_CF)?;
        match self
            .db
            .get_cf(&cf, key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            Some(bytes) => {
                let item: StorageItem = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    fn store_item(&self, key: &ShardHash, item: &StorageItem) -> Result<(), StoreError> {
        let cf = self.cf(ITEM_CF)?;
        let encoded = serde_json::to_vec(item)?;
        self.db
            .put_cf(&cf, key.as_bytes(), encoded)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    fn shard_present(&self, key: &ShardHash) -> Result<bool, StoreError> {
        let cf = self.cf(SHARD_CF)?;
        Ok(self
            .db
            .get_pinned_cf(&cf, key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some())
    }
}

#[async_trait]
impl StorageAdapter for KvAdapter {
    async fn get(&self, key: &ShardHash) -> Result<StorageItem, StoreError> {
        let has_shard = self.shard_present(key)?;
        match self.load_item(key)? {
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
        self.load_item(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_hex()))
    }

    async fn put(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        if item.hash != *key {
            return Err(StoreError::KeyMismatch);
        }
        let merged = match self.load_item(key)? {
            Some(mut held) => {
                held.merge(item);
                held
            }
            None => item,
        };
        self.store_item(key, &merged)?;
        debug!(key = %key, "Stored item metadata");
        Ok(())
    }

    async fn replace(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        if item.hash != *key {
            return Err(StoreError::KeyMismatch);
        }
        self.store_item(key, &item)
    }

    async fn del(&self, key: &ShardHash) -> Result<(), StoreError> {
        let cf = self.cf(SHARD_CF)?;
        self.db
            .delete_cf(&cf, key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ShardHash>, StoreError> {
        let cf = self.cf(ITEM_CF)?;
        let mut keys = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() == 20 {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(&key);
                keys.push(ShardHash::new(arr));
            }
        }
        Ok(keys)
    }

    async fn size(&self) -> Result<u64, StoreError> {
        let cf = self.cf(SHARD_CF)?;
        let mut total = 0u64;
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            total += value.len() as u64;
        }
        Ok(total)
    }

    async fn has_shard(&self, key: &ShardHash) -> Result<bool, StoreError> {
        self.shard_present(key)
    }

    async fn open_source(&self, key: &ShardHash) -> Result<Box<dyn ShardRead>, StoreError> {
        let cf = self.cf(SHARD_CF)?;
        let data = self
            .db
            .get_cf(&cf, key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::ShardMissing(key.to_hex()))?;
        Ok(Box::new(BufferSource::new(Bytes::from(data))))
    }

    async fn open_sink(&self, key: &ShardHash) -> Result<Box<dyn ShardWrite>, StoreError> {
        Ok(Box::new(KvSink {
            key: *key,
            db: Arc::clone(&self.db),
            buf: Vec::new(),
        }))
    }
}

struct KvSink {
    key: ShardHash,
    db: Arc<DB>,
    buf: Vec<u8>,
}

#[async_trait]
impl ShardWrite for KvSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let cf = self
            .db
            .cf_handle(SHARD_CF)
            .ok_or_else(|| StoreError::Database(format!("Missing column family: {SHARD_CF}")))?;
        self.db
            .put_cf(&cf, self.key.as_bytes(), &self.buf)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
