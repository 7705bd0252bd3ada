use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::planner::{ChunkPlan, ChunkSpan};

/// Reads the chunks of a local file according to a [`ChunkPlan`].
pub struct ChunkReader {
    file: tokio::fs::File,
    plan: ChunkPlan,
}

impl ChunkReader {
    /// Opens `path` and plans it with `chunk_size`.
    pub async fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let plan = ChunkPlan::new(size, chunk_size)?;
        Ok(Self { file, plan })
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Reads a whole chunk into memory.
    pub async fn read_span(&mut self, span: &ChunkSpan) -> Result<Vec<u8>, TransferError> {
        self.read_at(span.offset, span.len as usize).await
    }

    /// Reads `len` bytes starting at file offset `offset`.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
