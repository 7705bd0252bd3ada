use std::path::{Path, PathBuf};

use chunkferry_protocol::constants::{
    ADMISSION_WORKERS, CHUNK_SIZE, DISK_SAFETY_MARGIN, FINGERPRINT_WINDOW, MERGE_WORKERS,
};
use chunkferry_transfer::ChunkPlan;

use crate::StoreError;

/// Storage layout and tuning for a [`FileService`](crate::FileService).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Merged files live at `files_dir/{file_hash}`.
    pub files_dir: PathBuf,
    /// Chunks live at `chunks_dir/{file_hash}/{index}`.
    pub chunks_dir: PathBuf,
    pub chunk_size: u64,
    pub fingerprint_window: u64,
    pub merge_workers: usize,
    pub admission_workers: usize,
    /// Extra free space required on top of the file size before merging.
    pub safety_margin: u64,
}

impl StoreConfig {
    /// Default tuning with `files/` and `chunks/` under `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            files_dir: root.join("files"),
            chunks_dir: root.join("chunks"),
            chunk_size: CHUNK_SIZE,
            fingerprint_window: FINGERPRINT_WINDOW,
            merge_workers: MERGE_WORKERS,
            admission_workers: ADMISSION_WORKERS,
            safety_margin: DISK_SAFETY_MARGIN,
        }
    }

    pub fn chunk_dir(&self, file_hash: &str) -> PathBuf {
        self.chunks_dir.join(file_hash)
    }

    pub fn chunk_path(&self, file_hash: &str, index: u64) -> PathBuf {
        self.chunk_dir(file_hash).join(index.to_string())
    }

    pub fn file_path(&self, file_hash: &str) -> PathBuf {
        self.files_dir.join(file_hash)
    }

    pub fn plan(&self, size: u64) -> Result<ChunkPlan, StoreError> {
        Ok(ChunkPlan::new(size, self.chunk_size)?)
    }
}
