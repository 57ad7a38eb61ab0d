//! Filesystem storage adapter: one directory per shard.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<40-hex-hash>/item.json   metadata
//! <root>/<40-hex-hash>/shard.bin   raw shard bytes
//! ```
//!
//! Writes land in `shard.partial` and rename into place on commit, so a
//! crashed transfer never leaves a half shard behind under the final name.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use storj_core::{identifiers::is_hash_key, ShardHash};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::shard::{ShardRead, ShardWrite, SOURCE_CHUNK};
use crate::{StorageAdapter, StorageItem, StoreError};

const ITEM_FILE: &str = "item.json";
const SHARD_FILE: &str = "shard.bin";
const PARTIAL_FILE: &str = "shard.partial";

/// Adapter persisting each shard in its own directory.
pub struct FsAdapter {
    root: PathBuf,
}

impl FsAdapter {
    /// Creates the adapter, ensuring the root directory exists.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dir(&self, key: &ShardHash) -> PathBuf {
        self.root.join(key.to_hex())
    }

    fn item_path(&self, key: &ShardHash) -> PathBuf {
        self.dir(key).join(ITEM_FILE)
    }

    fn shard_path(&self, key: &ShardHash) -> PathBuf {
        self.dir(key).join(SHARD_FILE)
    }

    async fn load_item(&self, key: &ShardHash) -> Result<Option<StorageItem>, StoreError> {
        match tokio::fs::read(self.item_path(key)).await {
            Ok(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                Ok(Some(item))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_item(&self, key: &ShardHash, item: &StorageItem) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.dir(key)).await?;
        let encoded = serde_json::to_vec_pretty(item)?;
        tokio::fs::write(self.item_path(key), encoded).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for FsAdapter {
    async fn get(&self, key: &ShardHash) -> Result<StorageItem, StoreError> {
        let has_shard = self.shard_path(key).exists();
        match self.load_item(key).await? {
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
        self.load_item(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_hex()))
    }

    async fn put(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        if item.hash != *key {
            return Err(StoreError::KeyMismatch);
        }
        let merged = match self.load_item(key).await? {
            Some(mut held) => {
                held.merge(item);
                held
            }
            None => item,
        };
        self.store_item(key, &merged).await
    }

    async fn replace(&self, key: &ShardHash, item: StorageItem) -> Result<(), StoreError> {
        if item.hash != *key {
            return Err(StoreError::KeyMismatch);
        }
        self.store_item(key, &item).await
    }

    async fn del(&self, key: &ShardHash) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.shard_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<ShardHash>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_hash_key(name) {
                if let Ok(hash) = ShardHash::from_hex(name) {
                    keys.push(hash);
                }
            }
        }
        Ok(keys)
    }

    async fn size(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for key in self.keys().await? {
            match tokio::fs::metadata(self.shard_path(&key)).await {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    async fn has_shard(&self, key: &ShardHash) -> Result<bool, StoreError> {
        Ok(self.shard_path(key).exists())
    }

    async fn open_source(&self, key: &ShardHash) -> Result<Box<dyn ShardRead>, StoreError> {
        let file = match tokio::fs::File::open(self.shard_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ShardMissing(key.to_hex()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(FileSource { file }))
    }

    async fn open_sink(&self, key: &ShardHash) -> Result<Box<dyn ShardWrite>, StoreError> {
        let dir = self.dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let partial = dir.join(PARTIAL_FILE);
        let file = tokio::fs::File::create(&partial).await?;
        Ok(Box::new(FileSink {
            file,
            partial,
            target: dir.join(SHARD_FILE),
        }))
    }
}

struct FileSource {
    file: tokio::fs::File,
}

#[async_trait]
impl ShardRead for FileSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
        let mut buf = vec![0u8; SOURCE_CHUNK];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

struct FileSink {
    file: tokio::fs::File,
    partial: PathBuf,
    target: PathBuf,
}

#[async_trait]
impl ShardWrite for FileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.file.flush().await?;
        drop(self.file);
        tokio::fs::rename(&self.partial, &self.target).await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        drop(self.file);
        match tokio::fs::remove_file(&self.partial).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::read_all;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_item_roundtrip() {
        let dir = TempDir::new().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();
        let hash = ShardHash::of(b"hello storj");

        adapter.put(&hash, StorageItem::new(hash)).await.unwrap();
        assert_eq!(adapter.peek(&hash).await.unwrap().hash, hash);
    }

    #[tokio::test]
    async fn test_shard_roundtrip() {
        let dir = TempDir::new().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();
        let hash = ShardHash::of(b"hello storj");

        let mut sink = adapter.open_sink(&hash).await.unwrap();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"storj").await.unwrap();
        sink.commit().await.unwrap();

        let mut source = adapter.open_source(&hash).await.unwrap();
        assert_eq!(read_all(source.as_mut()).await.unwrap(), b"hello storj");
        assert_eq!(adapter.size().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_abort_removes_partial() {
        let dir = TempDir::new().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();
        let hash = ShardHash::of(b"x");

        let mut sink = adapter.open_sink(&hash).await.unwrap();
        sink.write(b"partial bytes").await.unwrap();
        sink.abort().await.unwrap();

        assert!(!adapter.has_shard(&hash).await.unwrap());
        let partial = dir.path().join(hash.to_hex()).join(PARTIAL_FILE);
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_keys_only_hash_directories() {
        let dir = TempDir::new().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();
        let hash = ShardHash::of(b"a");
        adapter.put(&hash, StorageItem::new(hash)).await.unwrap();

        // A stray directory must not surface as a key.
        std::fs::create_dir(dir.path().join("not-a-shard")).unwrap();

        let keys = adapter.keys().await.unwrap();
        assert_eq!(keys, vec![hash]);
    }

    #[tokio::test]
    async fn test_del_keeps_item() {
        let dir = TempDir::new().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();
        let hash = ShardHash::of(b"payload");

        adapter.put(&hash, StorageItem::new(hash)).await.unwrap();
        let mut sink = adapter.open_sink(&hash).await.unwrap();
        sink.write(b"payload").await.unwrap();
        sink.commit().await.unwrap();

        adapter.del(&hash).await.unwrap();
        assert!(!adapter.has_shard(&hash).await.unwrap());
        assert!(adapter.peek(&hash).await.is_ok());
    }
}
