//! File demuxer: splits a byte source into fixed-size shards.

use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::MuxError;

/// One emitted shard: its ascending index and its bytes.
#[derive(Debug, Clone)]
pub struct Shard {
    /// Position of this shard within the file, starting at zero.
    pub index: u32,
    /// The shard bytes; only the final shard may be shorter than the
    /// configured shard size.
    pub data: Bytes,
}

/// Splits a readable source into `shard_size` pieces, in order.
pub struct FileDemuxer<R> {
    source: R,
    shard_size: usize,
    index: u32,
    finished: bool,
}

impl FileDemuxer<tokio::fs::File> {
    /// Opens a local file for demuxing.
    pub async fn open(path: impl AsRef<Path>, shard_size: u64) -> Result<Self, MuxError> {
        let file = tokio::fs::File::open(path).await?;
        Self::from_reader(file, shard_size)
    }
}

impl<R: AsyncRead + Unpin> FileDemuxer<R> {
    /// Wraps any readable source.
    pub fn from_reader(source: R, shard_size: u64) -> Result<Self, MuxError> {
        if shard_size == 0 {
            return Err(MuxError::InvalidShardSize);
        }
        Ok(Self {
            source,
            shard_size: shard_size as usize,
            index: 0,
            finished: false,
        })
    }

    /// Reads the next shard, or `None` once the source is exhausted.
    ///
    /// Shards come out strictly in index order; concatenating them
    /// reproduces the source bytes exactly.
    pub async fn next_shard(&mut self) -> Result<Option<Shard>, MuxError> {
        if self.finished {
            return Ok(None);
        }

        let mut data = vec![0u8; self.shard_size];
        let mut filled = 0;

        while filled < self.shard_size {
            let n = self.source.read(&mut data[filled..]).await?;
            if n == 0 {
                self.finished = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        data.truncate(filled);
        let shard = Shard {
            index: self.index,
            data: Bytes::from(data),
        };
        self.index += 1;
        Ok(Some(shard))
    }

    /// Returns the number of shards a source of `total_size` bytes yields.
    pub fn shard_count(total_size: u64, shard_size: u64) -> u64 {
        if total_size == 0 {
            0
        } else {
            total_size.div_ceil(shard_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect<R: AsyncRead + Unpin>(mut demuxer: FileDemuxer<R>) -> Vec<Shard> {
        let mut shards = Vec::new();
        while let Some(shard) = demuxer.next_shard().await.unwrap() {
            shards.push(shard);
        }
        shards
    }

    #[tokio::test]
    async fn test_even_split() {
        let data: Vec<u8> = (0..64u8).collect();
        let demuxer = FileDemuxer::from_reader(Cursor::new(data.clone()), 16).unwrap();
        let shards = collect(demuxer).await;

        assert_eq!(shards.len(), 4);
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.index, i as u32);
            assert_eq!(shard.data.len(), 16);
        }

        let joined: Vec<u8> = shards.iter().flat_map(|s| s.data.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_short_final_shard() {
        let data: Vec<u8> = (0..70u8).collect();
        let demuxer = FileDemuxer::from_reader(Cursor::new(data.clone()), 32).unwrap();
        let shards = collect(demuxer).await;

        assert_eq!(shards.len(), 3);
        assert_eq!(shards[2].data.len(), 6);

        let joined: Vec<u8> = shards.iter().flat_map(|s| s.data.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let demuxer = FileDemuxer::from_reader(Cursor::new(Vec::new()), 16).unwrap();
        let shards = collect(demuxer).await;
        assert!(shards.is_empty());
    }

    #[tokio::test]
    async fn test_zero_shard_size_rejected() {
        let result = FileDemuxer::from_reader(Cursor::new(vec![1u8]), 0);
        assert!(matches!(result, Err(MuxError::InvalidShardSize)));
    }

    #[tokio::test]
    async fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        let data: Vec<u8> = (0..200).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let demuxer = FileDemuxer::open(&path, 64).await.unwrap();
        let shards = collect(demuxer).await;

        assert_eq!(shards.len(), 4);
        let joined: Vec<u8> = shards.iter().flat_map(|s| s.data.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_shard_count() {
        assert_eq!(FileDemuxer::<Cursor<Vec<u8>>>::shard_count(0, 8), 0);
        assert_eq!(FileDemuxer::<Cursor<Vec<u8>>>::shard_count(8, 8), 1);
        assert_eq!(FileDemuxer::<Cursor<Vec<u8>>>::shard_count(9, 8), 2);
    }
}
