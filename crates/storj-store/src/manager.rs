//! Shard manager: policy over a storage adapter.
//!
//! The manager owns the adapter handle and applies what the raw adapters do
//! not: a capacity ceiling, one writer per key at a time, and reaping of
//! shards whose every contract has expired.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use storj_core::{ShardHash, Timestamp};
use tracing::{debug, info};

use crate::shard::{ShardRead, ShardWrite};
use crate::{StorageAdapter, StorageItem, StoreError};

/// Policy wrapper around a [`StorageAdapter`].
pub struct ShardManager {
    adapter: Arc<dyn StorageAdapter>,
    max_capacity: u64,
    writes_in_flight: Arc<Mutex<HashSet<ShardHash>>>,
}

impl ShardManager {
    /// Creates a manager over an adapter with a byte capacity ceiling.
    pub fn new(adapter: Arc<dyn StorageAdapter>, max_capacity: u64) -> Self {
        Self {
            adapter,
            max_capacity,
            writes_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns the underlying adapter.
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Loads an item with shard presence resolved.
    pub async fn get(&self, key: &ShardHash) -> Result<StorageItem, StoreError> {
        self.adapter.get(key).await
    }

    /// Loads item metadata only.
    pub async fn peek(&self, key: &ShardHash) -> Result<StorageItem, StoreError> {
        self.adapter.peek(key).await
    }

    /// Merges an item into the store.
    pub async fn put(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        self.adapter.put(key, item).await
    }

    /// Removes shard bytes, retaining metadata.
    pub async fn del(&self, key: &ShardHash) -> Result<(), StoreError> {
        self.adapter.del(key).await
    }

    /// Lists stored keys.
    pub async fn keys(&self) -> Result<Vec<ShardHash>, StoreError> {
        self.adapter.keys().await
    }

    /// Returns total shard bytes held.
    pub async fn size(&self) -> Result<u64, StoreError> {
        self.adapter.size().await
    }

    /// Returns true when the shard bytes are present.
    pub async fn has_shard(&self, key: &ShardHash) -> Result<bool, StoreError> {
        self.adapter.has_shard(key).await
    }

    /// Opens a read stream over a shard.
    pub async fn open_source(&self, key: &ShardHash) -> Result<Box<dyn ShardRead>, StoreError> {
        self.adapter.open_source(key).await
    }

    /// Opens a managed write sink for a shard of `expected_size` bytes.
    ///
    /// Fails `StorageFull` when the shard would exceed capacity and
    /// `WriteInProgress` when another writer holds the key. The key is
    /// released when the returned sink commits or aborts.
    pub async fn open_sink(
        &self,
        key: &ShardHash,
        expected_size: u64,
    ) -> Result<ManagedSink, StoreError> {
        let used = self.adapter.size().await?;
        if used.saturating_add(expected_size) > self.max_capacity {
            return Err(StoreError::StorageFull);
        }

        {
            let mut in_flight = self.writes_in_flight.lock();
            if !in_flight.insert(*key) {
                return Err(StoreError::WriteInProgress(key.to_hex()));
            }
        }

        match self.adapter.open_sink(key).await {
            Ok(inner) => Ok(ManagedSink {
                inner: Some(inner),
                guard: WriteGuard {
                    key: *key,
                    writes_in_flight: Arc::clone(&self.writes_in_flight),
                },
            }),
            Err(e) => {
                self.writes_in_flight.lock().remove(key);
                Err(e)
            }
        }
    }

    /// Reaps expired contracts; deletes shard bytes with no live contract.
    ///
    /// Counterparties whose storage window has passed are pruned from the
    /// item (contract, tree, challenges, meta) while the rest stay intact;
    /// once no contract covers the shard the bytes go too. Returns the keys
    /// whose shard bytes were deleted.
    pub async fn clean_expired(&self, now: Timestamp) -> Result<Vec<ShardHash>, StoreError> {
        let mut deleted = Vec::new();

        for key in self.adapter.keys().await? {
            let mut item = match self.adapter.peek(&key).await {
                Ok(item) => item,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            if item.contracts.is_empty() {
                continue;
            }

            if item.is_expired(now) {
                debug!(key = %key, "Every contract expired");
                self.adapter.del(&key).await?;
                deleted.push(key);
            }

            let reaped = item.reap_expired(now);
            if reaped > 0 {
                debug!(key = %key, reaped, "Reaped expired counterparties");
                self.adapter.replace(&key, item).await?;
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "Deleted shards with no live contract");
        }
        Ok(deleted)
    }
}

/// Write guard releasing the per-key lock when the sink resolves.
struct WriteGuard {
    key: ShardHash,
    writes_in_flight: Arc<Mutex<HashSet<ShardHash>>>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.writes_in_flight.lock().remove(&self.key);
    }
}

/// A shard sink holding the manager's per-key write lock.
pub struct ManagedSink {
    inner: Option<Box<dyn ShardWrite>>,
    guard: WriteGuard,
}

impl ManagedSink {
    /// Appends a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.inner
            .as_mut()
            .expect("sink not yet resolved")
            .write(chunk)
            .await
    }

    /// Publishes the shard bytes and releases the key.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        let inner = self.inner.take().expect("sink not yet resolved");
        let result = inner.commit().await;
        drop(self.guard);
        result
    }

    /// Discards the bytes and releases the key.
    pub async fn abort(mut self) -> Result<(), StoreError> {
        let inner = self.inner.take().expect("sink not yet resolved");
        let result = inner.abort().await;
        drop(self.guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryAdapter;
    use storj_core::KeyPair;
    use storj_proto::Contract;

    fn manager(capacity: u64) -> ShardManager {
        ShardManager::new(Arc::new(MemoryAdapter::new()), capacity)
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let manager = manager(10);
        let hash = ShardHash::of(b"hello storj");

        assert!(matches!(
            manager.open_sink(&hash, 11).await,
            Err(StoreError::StorageFull)
        ));

        let sink = manager.open_sink(&hash, 10).await.unwrap();
        sink.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_writer_per_key() {
        let manager = manager(1024);
        let hash = ShardHash::of(b"hello storj");

        let first = manager.open_sink(&hash, 11).await.unwrap();
        assert!(matches!(
            manager.open_sink(&hash, 11).await,
            Err(StoreError::WriteInProgress(_))
        ));

        first.commit().await.unwrap();
        let again = manager.open_sink(&hash, 11).await.unwrap();
        again.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_releases_key() {
        let manager = manager(1024);
        let hash = ShardHash::of(b"x");

        let sink = manager.open_sink(&hash, 1).await.unwrap();
        sink.abort().await.unwrap();
        let sink = manager.open_sink(&hash, 1).await.unwrap();
        sink.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_reaps_stale_counterparty() {
        let manager = manager(1024);
        let renter = KeyPair::generate();
        let farmer_a = *KeyPair::generate().node_id();
        let farmer_b = *KeyPair::generate().node_id();
        let hash = ShardHash::of(b"hello storj");

        let short = Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(hash)
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(1_000))
            .build()
            .unwrap();
        let long = Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(hash)
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(10_000))
            .build()
            .unwrap();

        let mut item = StorageItem::new(hash);
        item.add_contract(farmer_a, short);
        item.add_contract(farmer_b, long);
        item.trees.insert(farmer_a, vec!["aa".repeat(20)]);
        item.trees.insert(farmer_b, vec!["bb".repeat(20)]);
        manager.put(&hash, item).await.unwrap();

        let mut sink = manager.open_sink(&hash, 11).await.unwrap();
        sink.write(b"hello storj").await.unwrap();
        sink.commit().await.unwrap();

        // Farmer A's window lapsed; its state goes, B's stays, bytes stay.
        let deleted = manager.clean_expired(Timestamp::new(5_000)).await.unwrap();
        assert!(deleted.is_empty());
        assert!(manager.has_shard(&hash).await.unwrap());

        let item = manager.peek(&hash).await.unwrap();
        assert!(item.contract_for(&farmer_a).is_none());
        assert!(!item.trees.contains_key(&farmer_a));
        assert!(item.contract_for(&farmer_b).is_some());
        assert!(item.trees.contains_key(&farmer_b));

        // Once B lapses too, the shard bytes follow.
        let deleted = manager.clean_expired(Timestamp::new(20_000)).await.unwrap();
        assert_eq!(deleted, vec![hash]);
        assert!(!manager.has_shard(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_expired_deletes_shards() {
        let manager = manager(1024);
        let renter = KeyPair::generate();
        let farmer = *KeyPair::generate().node_id();
        let hash = ShardHash::of(b"hello storj");

        let contract = Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(hash)
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(1_000))
            .build()
            .unwrap();

        let mut item = StorageItem::new(hash);
        item.add_contract(farmer, contract);
        manager.put(&hash, item).await.unwrap();

        let mut sink = manager.open_sink(&hash, 11).await.unwrap();
        sink.write(b"hello storj").await.unwrap();
        sink.commit().await.unwrap();

        // Before expiry nothing happens.
        let deleted = manager.clean_expired(Timestamp::new(500)).await.unwrap();
        assert!(deleted.is_empty());
        assert!(manager.has_shard(&hash).await.unwrap());

        let deleted = manager.clean_expired(Timestamp::new(2_000)).await.unwrap();
        assert_eq!(deleted, vec![hash]);
        assert!(!manager.has_shard(&hash).await.unwrap());
    }
}
