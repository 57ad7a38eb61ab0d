//! File muxer: ordered reassembly of shard sources into one byte stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::MuxError;

const READ_CHUNK: usize = 8192;

type Input = Box<dyn AsyncRead + Send + Unpin>;

/// Construction parameters for a [`FileMuxer`].
///
/// Both fields are required; absent or non-positive values are rejected at
/// construction so a malformed download manifest fails before any bytes move.
#[derive(Debug, Clone, Copy, Default)]
pub struct MuxerOptions {
    /// Total number of shard inputs that will be registered.
    pub shards: Option<i64>,
    /// Total number of bytes the inputs will deliver together.
    pub length: Option<i64>,
}

/// Reassembles shard inputs into the original byte stream.
///
/// Inputs drain strictly in registration order: every byte of input `i` is
/// delivered before any byte of input `i + 1`. The muxer pulls one chunk at
/// a time and holds no buffer beyond the chunk in flight.
pub struct FileMuxer {
    shards: usize,
    length: u64,
    inputs: Vec<Input>,
    current: usize,
    delivered: u64,
}

impl std::fmt::Debug for FileMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMuxer")
            .field("shards", &self.shards)
            .field("length", &self.length)
            .field("current", &self.current)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

impl FileMuxer {
    /// Creates a muxer for `options.shards` inputs totalling
    /// `options.length` bytes.
    pub fn new(options: MuxerOptions) -> Result<Self, MuxError> {
        let shards = match options.shards {
            Some(n) if n > 0 => n as usize,
            _ => return Err(MuxError::InvalidShardCount),
        };
        let length = match options.length {
            None => return Err(MuxError::MissingLength),
            Some(n) if n > 0 => n as u64,
            Some(_) => return Err(MuxError::InvalidLength),
        };

        Ok(Self {
            shards,
            length,
            inputs: Vec::with_capacity(shards),
            current: 0,
            delivered: 0,
        })
    }

    /// Registers the next shard input, in arrival order.
    pub fn input<R: AsyncRead + Send + Unpin + 'static>(
        &mut self,
        source: R,
    ) -> Result<(), MuxError> {
        if self.inputs.len() >= self.shards {
            return Err(MuxError::TooManyInputs);
        }
        self.inputs.push(Box::new(source));
        Ok(())
    }

    /// Extends the declared capacity mid-stream.
    ///
    /// Streaming downloads discover trailing shards after construction; this
    /// raises both limits explicitly instead of mutating them implicitly.
    pub fn grow(&mut self, additional_shards: usize, additional_length: u64) -> Result<(), MuxError> {
        if additional_shards == 0 {
            return Err(MuxError::InvalidGrowth);
        }
        self.shards += additional_shards;
        self.length += additional_length;
        Ok(())
    }

    /// Returns the number of bytes delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Returns true once exactly `length` bytes have been delivered.
    pub fn is_complete(&self) -> bool {
        self.delivered == self.length
    }

    /// Pulls the next chunk, or `None` once the declared length is reached.
    ///
    /// Errors when no input can supply the next byte: either nothing is
    /// registered yet, or the registered inputs ended short of `length`.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, MuxError> {
        if self.is_complete() {
            return Ok(None);
        }

        loop {
            let input = match self.inputs.get_mut(self.current) {
                Some(input) => input,
                None => return Err(MuxError::UnexpectedEnd),
            };

            let mut buf = vec![0u8; READ_CHUNK];
            let n = input.read(&mut buf).await?;

            if n == 0 {
                // Current input exhausted; commit to the next one.
                self.current += 1;
                if self.is_complete() {
                    return Ok(None);
                }
                continue;
            }

            self.delivered += n as u64;
            if self.delivered > self.length {
                return Err(MuxError::LengthExceeded);
            }

            buf.truncate(n);
            return Ok(Some(Bytes::from(buf)));
        }
    }

    /// Drains every input and returns the reassembled bytes.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, MuxError> {
        let mut out = Vec::with_capacity(self.length as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decimal_run(from: u32, to: u32) -> Cursor<Vec<u8>> {
        let joined: String = (from..=to).map(|n| n.to_string()).collect();
        Cursor::new(joined.into_bytes())
    }

    #[tokio::test]
    async fn test_basic_ordering() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(4),
            length: Some(71),
        })
        .unwrap();

        muxer.input(decimal_run(1, 10)).unwrap();
        muxer.input(decimal_run(11, 20)).unwrap();
        muxer.input(decimal_run(21, 30)).unwrap();
        muxer.input(decimal_run(31, 40)).unwrap();

        let out = muxer.read_to_end().await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "12345678910111213141516171819202122232425262728293031323334353637383940"
        );
        assert!(muxer.is_complete());
    }

    #[tokio::test]
    async fn test_negative_shards_rejected() {
        let err = FileMuxer::new(MuxerOptions {
            shards: Some(-1),
            length: Some(128),
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Cannot multiplex a 0 shard stream");
    }

    #[tokio::test]
    async fn test_missing_length_rejected() {
        let err = FileMuxer::new(MuxerOptions {
            shards: Some(2),
            length: None,
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "You must supply a length parameter");
    }

    #[tokio::test]
    async fn test_input_exceeding_length() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(2),
            length: Some(2),
        })
        .unwrap();
        muxer.input(Cursor::new(vec![0x01, 0x02, 0x03])).unwrap();

        let err = muxer.read_to_end().await.unwrap_err();
        assert_eq!(err.to_string(), "Input exceeds the declared length");
    }

    #[tokio::test]
    async fn test_read_before_inputs() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(1),
            length: Some(10),
        })
        .unwrap();

        let err = muxer.next_chunk().await.unwrap_err();
        assert_eq!(err.to_string(), "Unexpected end of source stream");
    }

    #[tokio::test]
    async fn test_short_inputs_error_at_terminal_read() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(2),
            length: Some(10),
        })
        .unwrap();
        muxer.input(Cursor::new(vec![1u8; 4])).unwrap();
        muxer.input(Cursor::new(vec![2u8; 4])).unwrap();

        // Eight bytes arrive fine, the terminal read errors.
        let mut total = 0;
        let err = loop {
            match muxer.next_chunk().await {
                Ok(Some(chunk)) => total += chunk.len(),
                Ok(None) => panic!("muxer completed short"),
                Err(e) => break e,
            }
        };
        assert_eq!(total, 8);
        assert!(matches!(err, MuxError::UnexpectedEnd));
    }

    #[tokio::test]
    async fn test_too_many_inputs() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(1),
            length: Some(4),
        })
        .unwrap();
        muxer.input(Cursor::new(vec![1u8; 4])).unwrap();

        let err = muxer.input(Cursor::new(vec![2u8; 4])).unwrap_err();
        assert!(matches!(err, MuxError::TooManyInputs));
    }

    #[tokio::test]
    async fn test_grow_admits_more_inputs() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(1),
            length: Some(4),
        })
        .unwrap();
        muxer.input(Cursor::new(vec![1u8; 4])).unwrap();

        muxer.grow(1, 4).unwrap();
        muxer.input(Cursor::new(vec![2u8; 4])).unwrap();

        let out = muxer.read_to_end().await.unwrap();
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_grow_by_zero_rejected() {
        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(1),
            length: Some(4),
        })
        .unwrap();
        assert!(matches!(muxer.grow(0, 4), Err(MuxError::InvalidGrowth)));
    }

    #[tokio::test]
    async fn test_demux_mux_roundtrip() {
        use crate::demux::FileDemuxer;

        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let mut demuxer = FileDemuxer::from_reader(Cursor::new(data.clone()), 1024).unwrap();

        let mut muxer = FileMuxer::new(MuxerOptions {
            shards: Some(10),
            length: Some(data.len() as i64),
        })
        .unwrap();

        while let Some(shard) = demuxer.next_shard().await.unwrap() {
            muxer.input(Cursor::new(shard.data.to_vec())).unwrap();
        }

        let out = muxer.read_to_end().await.unwrap();
        assert_eq!(out, data);
    }
}
