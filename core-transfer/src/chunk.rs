//! Chunk planning.
//!
//! A plan is a pure function of the byte length, so a resumed attempt
//! computes exactly the plan the interrupted one used.

/// Preferred chunk size (2 MiB).
pub const MAX_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Upper bound on the number of parts the platform accepts.
pub const MAX_CHUNK_COUNT: u64 = 10_000;

/// Byte range `[start, start + size)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// 0-based; the upload part number is `index + 1`
    pub index: usize,
    pub start: u64,
    pub size: u64,
}

impl Chunk {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// Split `total_size` bytes into contiguous chunks.
///
/// Chunks are [`MAX_CHUNK_SIZE`] long, grown just enough to keep the count
/// within [`MAX_CHUNK_COUNT`]; the final chunk holds the remainder.
///
/// ```
/// use core_transfer::chunk::{plan, MAX_CHUNK_SIZE};
///
/// let chunks = plan(MAX_CHUNK_SIZE + 1);
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[1].size, 1);
/// ```
pub fn plan(total_size: u64) -> Vec<Chunk> {
    if total_size <= MAX_CHUNK_SIZE {
        return vec![Chunk {
            index: 0,
            start: 0,
            size: total_size,
        }];
    }

    let chunk_size = MAX_CHUNK_SIZE.max(total_size.div_ceil(MAX_CHUNK_COUNT));
    let count = total_size.div_ceil(chunk_size);

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            Chunk {
                index: i as usize,
                start,
                size: chunk_size.min(total_size - start),
            }
        })
        .collect()
}
