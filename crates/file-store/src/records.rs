//! File identity state machine.

use std::io::ErrorKind;
use std::sync::Arc;

use chunkferry_protocol::messages::{ListRequest, VerifyRequest, VerifyResponse};
use chunkferry_protocol::{FileRecord, FileStatus, Fingerprint};
use chunkferry_transfer::{validate_file_hash, validate_filename, validate_size};
use tracing::{debug, info, warn};

use crate::{
    ChunkStore, MergeEngine, NewRecord, RecordLocks, RecordQuery, RecordStore, StoreConfig,
    StoreError,
};

/// Verify, rename and catalog operations over [`FileRecord`]s.
pub struct RecordService {
    config: Arc<StoreConfig>,
    records: Arc<dyn RecordStore>,
    locks: Arc<RecordLocks>,
    chunks: Arc<ChunkStore>,
    merge: Arc<MergeEngine>,
}

impl RecordService {
    pub fn new(
        config: Arc<StoreConfig>,
        records: Arc<dyn RecordStore>,
        locks: Arc<RecordLocks>,
        chunks: Arc<ChunkStore>,
        merge: Arc<MergeEngine>,
    ) -> Self {
        Self {
            config,
            records,
            locks,
            chunks,
            merge,
        }
    }

    /// Registers an upload intent and reports what is still missing.
    pub async fn verify(&self, req: &VerifyRequest) -> Result<VerifyResponse, StoreError> {
        validate_filename(&req.filename)?;
        validate_file_hash(&req.file_hash)?;
        validate_file_hash(&req.start_hash)?;
        validate_file_hash(&req.end_hash)?;
        validate_size(req.size)?;
        let plan = self.config.plan(req.size)?;

        let _guard = self.locks.lock(&req.file_hash).await;
        let mut record = match self.records.find_by_hash(&req.file_hash)? {
            Some(record) => record,
            None => {
                let record = self.records.insert(NewRecord {
                    filename: req.filename.clone(),
                    file_hash: req.file_hash.clone(),
                    start_hash: req.start_hash.clone(),
                    end_hash: req.end_hash.clone(),
                    file_path: self.config.file_path(&req.file_hash).display().to_string(),
                    size: req.size,
                })?;
                info!(id = record.id, file_hash = %record.file_hash, size = record.size, "new file record");
                record
            }
        };

        if record.filename != req.filename {
            debug!(id = record.id, stored = %record.filename, asserted = %req.filename, "rename conflict");
            return Ok(VerifyResponse::RenameConflict {
                id: record.id,
                origin_filename: record.filename,
            });
        }
        if record.size != req.size {
            return Err(StoreError::Validation(format!(
                "size {} does not match stored size {} for {}",
                req.size, record.size, record.file_hash
            )));
        }
        if record.status == FileStatus::Finished {
            return Ok(VerifyResponse::AlreadyComplete { id: record.id });
        }

        let dest = self.config.file_path(&record.file_hash);
        if record.status == FileStatus::ChunkMerging {
            if self.merge.is_active(record.id) {
                return Ok(VerifyResponse::NeedUpload {
                    id: record.id,
                    uploaded_list: (0..plan.chunk_count()).collect(),
                });
            }
            warn!(id = record.id, "record marked merging without a session, reverting");
            remove_if_exists(&dest).await?;
            record.status = FileStatus::ChunkUploaded;
            self.records.update(&record)?;
        }

        // A draining merge may still be writing out of order.
        if !self.merge.is_busy(record.id) {
            match tokio::fs::metadata(&dest).await {
                Ok(meta) if meta.len() == record.size => {
                    info!(id = record.id, "destination already complete");
                    record.status = FileStatus::Finished;
                    self.records.update(&record)?;
                    self.chunks.remove_dir(&record.file_hash).await?;
                    return Ok(VerifyResponse::AlreadyComplete { id: record.id });
                }
                Ok(meta) => {
                    debug!(id = record.id, len = meta.len(), "removing partial destination");
                    remove_if_exists(&dest).await?;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let uploaded_list = self.chunks.scan(&record.file_hash, &plan).await?;
        let next = if uploaded_list.len() as u64 == plan.chunk_count() {
            FileStatus::ChunkUploaded
        } else {
            FileStatus::ChunkUploading
        };
        if record.status != next {
            debug!(id = record.id, from = %record.status, to = %next, "status change");
            record.status = next;
            self.records.update(&record)?;
        }

        Ok(VerifyResponse::NeedUpload {
            id: record.id,
            uploaded_list,
        })
    }

    /// Content hash of a stored file with this fingerprint, if any.
    pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<String>, StoreError> {
        validate_file_hash(&fp.start_hash)?;
        validate_file_hash(&fp.end_hash)?;
        Ok(self.records.find_by_fingerprint(fp)?.map(|r| r.file_hash))
    }

    pub async fn rename(&self, id: u64, filename: &str) -> Result<(), StoreError> {
        validate_filename(filename)?;
        let record = self.detail(id)?;
        let _guard = self.locks.lock(&record.file_hash).await;
        let mut record = self.detail(id)?;
        if record.filename != filename {
            info!(id, from = %record.filename, to = %filename, "record renamed");
            record.filename = filename.to_string();
            self.records.update(&record)?;
        }
        Ok(())
    }

    pub fn detail(&self, id: u64) -> Result<FileRecord, StoreError> {
        self.records
            .find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))
    }

    pub fn list(&self, req: &ListRequest) -> Result<(usize, Vec<FileRecord>), StoreError> {
        if req.page == 0 || req.page_size == 0 {
            return Err(StoreError::Validation(
                "page and page size start at 1".into(),
            ));
        }
        let filename = req.filename.as_deref().filter(|f| !f.is_empty());
        self.records.list(&RecordQuery {
            page: req.page,
            page_size: req.page_size,
            filename: filename.map(String::from),
        })
    }

    /// Removes a record together with its merged file or chunks.
    pub async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let record = self.detail(id)?;
        let _guard = self.locks.lock(&record.file_hash).await;
        let record = self.detail(id)?;

        if self.merge.is_busy(id) {
            return Err(StoreError::Validation(format!(
                "record {id} is merging; cancel the merge first"
            )));
        }
        if let Err(e) = remove_if_exists(&self.config.file_path(&record.file_hash)).await {
            warn!(id, error = %e, "failed to remove merged file");
        }
        if let Err(e) = self.chunks.remove_dir(&record.file_hash).await {
            warn!(id, error = %e, "failed to remove chunk directory");
        }
        self.records.remove(id)?;
        info!(id, file_hash = %record.file_hash, "record deleted");
        Ok(())
    }

    pub async fn set_outside_download(&self, id: u64, enabled: bool) -> Result<(), StoreError> {
        let record = self.detail(id)?;
        let _guard = self.locks.lock(&record.file_hash).await;
        let mut record = self.detail(id)?;
        if record.outside_download != enabled {
            record.outside_download = enabled;
            self.records.update(&record)?;
        }
        Ok(())
    }

    /// Finished record published for anonymous download under `filename`.
    pub fn find_public(&self, filename: &str) -> Result<FileRecord, StoreError> {
        self.records
            .find_by_filename(filename)?
            .filter(|r| r.outside_download && r.status == FileStatus::Finished)
            .ok_or_else(|| StoreError::NotFound(format!("no public file named {filename}")))
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
