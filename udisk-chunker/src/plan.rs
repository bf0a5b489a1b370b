//! Fixed-size chunk partitioning shared by uploads and downloads.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{ChunkerError, Result};

/// Default chunk size (5 MB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// One contiguous byte range of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Position of the chunk within the plan
    pub index: u32,
    /// First byte covered by the chunk
    pub offset: u64,
    /// Number of bytes in the chunk
    pub length: u64,
}

impl ChunkInfo {
    pub fn byte_start(&self) -> u64 {
        self.offset
    }

    /// Last byte covered by the chunk, `None` for the empty chunk of a
    /// zero-length object.
    pub fn byte_end_inclusive(&self) -> Option<u64> {
        if self.length == 0 {
            None
        } else {
            Some(self.offset + self.length - 1)
        }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Partition of an object of `total_size` bytes into `chunk_size` pieces.
///
/// For `S` bytes and chunk size `C` the plan holds `ceil(S / C)` chunks; every
/// chunk but the last is exactly `C` bytes and the last covers the remainder.
/// A zero-length object is planned as a single empty chunk so that every
/// plan has at least one chunk to accept and complete.
///
/// ```rust
/// use udisk_chunker::ChunkPlan;
///
/// let plan = ChunkPlan::new(10, 4).unwrap();
/// let lengths: Vec<u64> = plan.chunks().iter().map(|c| c.length).collect();
/// assert_eq!(lengths, vec![4, 4, 2]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    chunks: Vec<ChunkInfo>,
}

impl ChunkPlan {
    /// Split `total_size` bytes into chunks of `chunk_size` bytes.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ChunkerError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }

        let count = total_size.div_ceil(chunk_size).max(1);
        if count > u64::from(u32::MAX) {
            return Err(ChunkerError::InvalidConfig(format!(
                "{} bytes at chunk size {} needs {} chunks",
                total_size, chunk_size, count
            )));
        }

        let chunks = (0..count)
            .map(|i| {
                let offset = i * chunk_size;
                ChunkInfo {
                    index: i as u32,
                    offset,
                    length: chunk_size.min(total_size - offset.min(total_size)),
                }
            })
            .collect::<Vec<_>>();

        trace!(
            "Planned {} bytes into {} chunks of {} bytes",
            total_size,
            chunks.len(),
            chunk_size
        );

        Ok(Self {
            total_size,
            chunk_size,
            chunks,
        })
    }

    /// A plan that moves the whole object as one chunk.
    pub fn single(total_size: u64) -> Self {
        Self {
            total_size,
            chunk_size: total_size,
            chunks: vec![ChunkInfo {
                index: 0,
                offset: 0,
                length: total_size,
            }],
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Plans always hold at least one chunk
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&ChunkInfo> {
        self.chunks.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ten_million_bytes_in_three_million_chunks() {
        let plan = ChunkPlan::new(10_000_000, 3_000_000).unwrap();
        let ranges: Vec<(u64, u64)> = plan
            .chunks()
            .iter()
            .map(|c| (c.byte_start(), c.byte_end_inclusive().unwrap()))
            .collect();

        assert_eq!(
            ranges,
            vec![
                (0, 2_999_999),
                (3_000_000, 5_999_999),
                (6_000_000, 8_999_999),
                (9_000_000, 9_999_999),
            ]
        );
    }

    #[test]
    fn test_exact_multiple() {
        let plan = ChunkPlan::new(12, 4).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.chunks().iter().all(|c| c.length == 4));
    }

    #[test]
    fn test_zero_length_is_one_empty_chunk() {
        let plan = ChunkPlan::new(0, 4).unwrap();
        assert_eq!(plan.len(), 1);
        let chunk = plan.get(0).unwrap();
        assert_eq!(chunk.length, 0);
        assert_eq!(chunk.byte_end_inclusive(), None);

        assert_eq!(ChunkPlan::single(0), ChunkPlan { total_size: 0, chunk_size: 0, chunks: vec![*chunk] });
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(ChunkPlan::new(100, 0).is_err());
    }

    #[test]
    fn test_single_plan() {
        let plan = ChunkPlan::single(42);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get(0).unwrap().end(), 42);
        assert!(plan.get(1).is_none());
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_the_object(size in 0u64..50_000, chunk in 1u64..5_000) {
            let plan = ChunkPlan::new(size, chunk).unwrap();
            prop_assert_eq!(plan.len() as u64, size.div_ceil(chunk).max(1));

            let mut next = 0u64;
            for (i, c) in plan.chunks().iter().enumerate() {
                prop_assert_eq!(c.index as usize, i);
                prop_assert_eq!(c.offset, next);
                if i + 1 < plan.len() {
                    prop_assert_eq!(c.length, chunk);
                }
                next = c.end();
            }
            prop_assert_eq!(next, size);
        }
    }
}
