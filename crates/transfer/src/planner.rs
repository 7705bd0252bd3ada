use std::collections::BTreeSet;

use crate::TransferError;

/// One chunk of a file: its index and byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Deterministic partition of a file into fixed-size chunks.
///
/// Every chunk except possibly the last is `chunk_size` bytes long; the last
/// one holds the remainder (or a full chunk when the size divides evenly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidSize("chunk size must be positive".into()));
        }
        if file_size == 0 {
            return Err(TransferError::InvalidSize("file size must be positive".into()));
        }
        Ok(Self {
            file_size,
            chunk_size,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Byte offset of chunk `index` in the file.
    pub fn offset_of(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Expected length of chunk `index`, or `None` when out of range.
    pub fn expected_len(&self, index: u64) -> Option<u64> {
        if index >= self.chunk_count() {
            return None;
        }
        let offset = self.offset_of(index);
        Some((self.file_size - offset).min(self.chunk_size))
    }

    pub fn span(&self, index: u64) -> Result<ChunkSpan, TransferError> {
        let len = self.expected_len(index).ok_or(TransferError::IndexOutOfRange {
            index,
            count: self.chunk_count(),
        })?;
        Ok(ChunkSpan {
            index,
            offset: self.offset_of(index),
            len,
        })
    }

    /// All chunks in index order.
    pub fn spans(&self) -> Vec<ChunkSpan> {
        (0..self.chunk_count())
            .map(|index| ChunkSpan {
                index,
                offset: self.offset_of(index),
                len: (self.file_size - self.offset_of(index)).min(self.chunk_size),
            })
            .collect()
    }

    /// Chunks not listed in `uploaded`, in index order.
    ///
    /// Indices outside the plan are ignored.
    pub fn remaining(&self, uploaded: &[u64]) -> Vec<ChunkSpan> {
        let done: BTreeSet<u64> = uploaded.iter().copied().collect();
        self.spans()
            .into_iter()
            .filter(|span| !done.contains(&span.index))
            .collect()
    }
}
