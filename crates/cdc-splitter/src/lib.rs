//! Content-defined block splitter for the folder sync engine.
//!
//! Given a byte stream and a target average block size, this produces a
//! lazy sequence of [`Block`]s whose boundaries are determined by content
//! rather than fixed offsets, so that local edits only disturb a bounded
//! window of split points. See [`rolling`] for the checksum itself.

mod rolling;

use rolling::RollingChecksum;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, Read};
use thiserror::Error;

pub use rolling::WINDOW;

/// Errors raised while configuring or running the splitter.
#[derive(Error, Debug)]
pub enum SplitError {
    #[error("I/O error while reading stream: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Tuning for one splitter run.
#[derive(Debug, Clone, Copy)]
pub struct SplitConfig {
    /// Target average block size in bytes (`B` in the design doc).
    pub avg_size: u32,
    /// Rolling window width in bytes. Production default is [`WINDOW`]; only
    /// test code has a reason to use a narrower window.
    pub window: usize,
}

impl SplitConfig {
    pub fn new(avg_size: u32) -> Result<Self, SplitError> {
        Self::with_window(avg_size, WINDOW)
    }

    pub fn with_window(avg_size: u32, window: usize) -> Result<Self, SplitError> {
        if avg_size == 0 {
            return Err(SplitError::InvalidConfig(
                "avg_size must be non-zero".to_string(),
            ));
        }
        if window == 0 {
            return Err(SplitError::InvalidConfig(
                "window must be non-zero".to_string(),
            ));
        }
        Ok(Self { avg_size, window })
    }

    /// `minBlock = B / 8`.
    fn min_block(&self) -> u32 {
        self.avg_size / 8
    }

    /// `target = 2^32 / B`.
    fn target(&self) -> u32 {
        ((1u64 << 32) / self.avg_size as u64) as u32
    }
}

/// A content-addressed block produced by the splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Byte offset of this block within the stream.
    pub offset: u64,
    /// Length of this block in bytes.
    pub size: u32,
    /// BLAKE3 digest of the block's bytes.
    #[serde(with = "serde_bytes_32")]
    pub hash: [u8; 32],
}

mod serde_bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected a 32-byte hash"))
    }
}

/// Streaming splitter: an [`Iterator`] of [`Block`]s over a [`Read`].
pub struct Splitter<R: Read> {
    reader: R,
    checksum: RollingChecksum,
    hasher: blake3::Hasher,
    block_len: u32,
    offset: u64,
    min_block: u32,
    target: u32,
    done: bool,
}

impl<R: Read> Splitter<R> {
    pub fn new(reader: R, config: SplitConfig) -> Self {
        Self {
            reader,
            checksum: RollingChecksum::with_window(config.window),
            hasher: blake3::Hasher::new(),
            block_len: 0,
            offset: 0,
            min_block: config.min_block(),
            target: config.target(),
            done: false,
        }
    }

    fn emit(&mut self) -> Block {
        let hash = *self.hasher.finalize().as_bytes();
        let block = Block {
            offset: self.offset,
            size: self.block_len,
            hash,
        };
        self.offset += self.block_len as u64;
        self.block_len = 0;
        self.hasher = blake3::Hasher::new();
        block
    }
}

impl<R: Read> Iterator for Splitter<R> {
    type Item = Result<Block, SplitError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => {
                    self.done = true;
                    if self.block_len == 0 {
                        return None;
                    }
                    return Some(Ok(self.emit()));
                }
                Ok(_) => {
                    let c = byte[0];
                    self.hasher.update(&[c]);
                    self.block_len += 1;
                    let sum = self.checksum.write_byte(c);
                    if sum < self.target && self.block_len > self.min_block {
                        return Some(Ok(self.emit()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(SplitError::Io(e)));
                }
            }
        }
    }
}

/// Split an in-memory buffer into blocks, collecting the iterator.
pub fn split_bytes(data: &[u8], avg_block_size: u32) -> Result<Vec<Block>, SplitError> {
    let config = SplitConfig::new(avg_block_size)?;
    let reader = BufReader::new(data);
    Splitter::new(reader, config).collect()
}
