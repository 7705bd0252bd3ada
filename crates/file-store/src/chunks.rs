//! Content-addressed chunk directory.
//!
//! A chunk `(file_hash, index)` exists iff `chunks_dir/{file_hash}/{index}`
//! holds exactly the planned number of bytes for that index. Anything else in
//! the directory is garbage and is purged on the next scan. Both upload paths
//! (whole-chunk admission and streamed sinks) go through this contract, so
//! they may interleave on the same hash.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkferry_transfer::{ChunkPlan, validate_file_hash, validate_size};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{StoreConfig, StoreError};

const PART_MARKER: &str = ".part-";

/// Result of offering a chunk to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The chunk was written.
    Stored,
    /// An identical-size chunk was already present; nothing was written.
    Duplicate,
    /// The merged file already exists; the chunk is no longer needed.
    AlreadyMerged,
}

impl Admission {
    pub fn is_duplicate(self) -> bool {
        !matches!(self, Self::Stored)
    }
}

/// Chunk storage shared by the control and transfer channels.
#[derive(Debug)]
pub struct ChunkStore {
    config: Arc<StoreConfig>,
    admission: Arc<Semaphore>,
}

impl ChunkStore {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        let admission = Arc::new(Semaphore::new(config.admission_workers.max(1)));
        Self { config, admission }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Admits a whole chunk idempotently.
    pub async fn admit(
        &self,
        file_hash: &str,
        size: u64,
        index: u64,
        bytes: &[u8],
    ) -> Result<Admission, StoreError> {
        validate_file_hash(file_hash)?;
        validate_size(size)?;
        let expected = self.config.plan(size)?.span(index)?.len;
        if bytes.len() as u64 != expected {
            return Err(StoreError::Validation(format!(
                "chunk {index} has {} bytes, expected {expected}",
                bytes.len()
            )));
        }

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| StoreError::Consistency("admission pool closed".into()))?;

        if tokio::fs::try_exists(self.config.file_path(file_hash)).await? {
            debug!(file_hash, index, "chunk offered for merged file");
            return Ok(Admission::AlreadyMerged);
        }

        self.ensure_dir(file_hash).await?;
        let path = self.config.chunk_path(file_hash, index);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() == expected => return Ok(Admission::Duplicate),
            Ok(meta) => {
                warn!(file_hash, index, len = meta.len(), expected, "replacing short chunk");
                remove_if_exists(&path).await?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(file_hash, index, "lost exclusive create to a concurrent upload");
                return Ok(Admission::Duplicate);
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes).await?;
        file.flush().await?;

        debug!(file_hash, index, len = expected, "chunk stored");
        Ok(Admission::Stored)
    }

    /// Lists the valid chunks of `file_hash`, deleting corrupt entries.
    ///
    /// Removes names that are not chunk indices, indices outside the plan and
    /// chunks of the wrong size. In-flight part files of streamed sinks are
    /// left alone. Returns the surviving indices in ascending order.
    pub async fn scan(&self, file_hash: &str, plan: &ChunkPlan) -> Result<Vec<u64>, StoreError> {
        let dir = self.config.chunk_dir(file_hash);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(PART_MARKER) {
                continue;
            }

            let valid = match name.parse::<u64>() {
                Ok(index) if index.to_string() == name => match plan.expected_len(index) {
                    Some(expected) => {
                        let len = entry.metadata().await?.len();
                        (len == expected).then_some(index)
                    }
                    None => None,
                },
                _ => None,
            };

            match valid {
                Some(index) => indices.push(index),
                None => {
                    warn!(file_hash, entry = %name, "purging invalid chunk entry");
                    let path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        tokio::fs::remove_dir_all(&path).await?;
                    } else {
                        remove_if_exists(&path).await?;
                    }
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Opens a private part file that will become chunk `index` on commit.
    ///
    /// When the merged file already exists the sink writes nothing and
    /// commits as [`Admission::AlreadyMerged`].
    pub async fn open_streamed(
        &self,
        file_hash: &str,
        size: u64,
        index: u64,
    ) -> Result<ChunkSink, StoreError> {
        validate_file_hash(file_hash)?;
        let expected = self.config.plan(size)?.span(index)?.len;
        let final_path = self.config.chunk_path(file_hash, index);
        let merged_path = self.config.file_path(file_hash);

        if tokio::fs::try_exists(&merged_path).await? {
            debug!(file_hash, index, "streamed chunk offered for merged file");
            return Ok(ChunkSink {
                file: None,
                part_path: None,
                final_path,
                merged_path,
                file_hash: file_hash.to_string(),
                index,
                expected,
                written: 0,
                merged: true,
            });
        }
        self.ensure_dir(file_hash).await?;

        let part_path = self
            .config
            .chunk_dir(file_hash)
            .join(format!("{index}{PART_MARKER}{}", Uuid::new_v4().simple()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)
            .await?;

        Ok(ChunkSink {
            file: Some(file),
            part_path: Some(part_path),
            final_path,
            merged_path,
            file_hash: file_hash.to_string(),
            index,
            expected,
            written: 0,
            merged: false,
        })
    }

    /// Removes every part file under the chunks directory.
    ///
    /// Only safe before any sink is open; a crash leaves parts that no
    /// [`ChunkSink`] will ever clean up. Returns the number removed.
    pub async fn purge_parts(&self) -> Result<usize, StoreError> {
        let mut dirs = match tokio::fs::read_dir(&self.config.chunks_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().contains(PART_MARKER) {
                    remove_if_exists(&entry.path()).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            warn!(removed, "purged part files left by an earlier run");
        }
        Ok(removed)
    }

    /// Size of chunk `index` on disk, if present.
    pub async fn stat_chunk(&self, file_hash: &str, index: u64) -> Result<Option<u64>, StoreError> {
        match tokio::fs::metadata(self.config.chunk_path(file_hash, index)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ensure_dir(&self, file_hash: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.config.chunk_dir(file_hash)).await?;
        Ok(())
    }

    /// Removes every chunk of `file_hash`.
    pub async fn remove_dir(&self, file_hash: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.config.chunk_dir(file_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append-only writer for one streamed chunk.
///
/// Dropping an uncommitted sink removes its part file.
#[derive(Debug)]
pub struct ChunkSink {
    file: Option<tokio::fs::File>,
    part_path: Option<PathBuf>,
    final_path: PathBuf,
    merged_path: PathBuf,
    file_hash: String,
    index: u64,
    expected: u64,
    written: u64,
    /// Data is counted but dropped.
    merged: bool,
}

impl ChunkSink {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Planned length of the chunk.
    pub fn expected_len(&self) -> u64 {
        self.expected
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.expected
    }

    /// Appends `data`, returning the new total. Refuses to exceed the planned length.
    pub async fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        if self.written + data.len() as u64 > self.expected {
            return Err(StoreError::Validation(format!(
                "chunk {} overflow: {} + {} > {}",
                self.index,
                self.written,
                data.len(),
                self.expected
            )));
        }
        if !self.merged {
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| StoreError::Consistency("chunk sink already closed".into()))?;
            file.write_all(data).await?;
        }
        self.written += data.len() as u64;
        Ok(self.written)
    }

    /// Publishes the part file as chunk `index`.
    ///
    /// If the merged file or a chunk of the planned size already exists the
    /// part is discarded and [`Admission::AlreadyMerged`] or
    /// [`Admission::Duplicate`] is returned.
    pub async fn commit(mut self) -> Result<Admission, StoreError> {
        if !self.is_complete() {
            return Err(StoreError::Validation(format!(
                "chunk {} incomplete: {} of {} bytes",
                self.index, self.written, self.expected
            )));
        }
        if self.merged {
            return Ok(Admission::AlreadyMerged);
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
        }
        let Some(part) = self.part_path.take() else {
            return Err(StoreError::Consistency("chunk sink already closed".into()));
        };

        if tokio::fs::try_exists(&self.merged_path).await? {
            remove_if_exists(&part).await?;
            debug!(file_hash = %self.file_hash, index = self.index, "file merged while chunk streamed");
            return Ok(Admission::AlreadyMerged);
        }
        match tokio::fs::metadata(&self.final_path).await {
            Ok(meta) if meta.len() == self.expected => {
                remove_if_exists(&part).await?;
                debug!(file_hash = %self.file_hash, index = self.index, "streamed chunk was a duplicate");
                return Ok(Admission::Duplicate);
            }
            Ok(_) | Err(_) => {}
        }
        tokio::fs::rename(&part, &self.final_path).await?;
        debug!(file_hash = %self.file_hash, index = self.index, len = self.expected, "streamed chunk committed");
        Ok(Admission::Stored)
    }

    /// Abandons the chunk and removes the part file.
    pub async fn discard(mut self) -> Result<(), StoreError> {
        self.file.take();
        if let Some(part) = self.part_path.take() {
            remove_if_exists(&part).await?;
        }
        Ok(())
    }
}

impl Drop for ChunkSink {
    fn drop(&mut self) {
        if let Some(part) = self.part_path.take() {
            let _ = std::fs::remove_file(part);
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
