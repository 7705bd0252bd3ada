use std::io::ErrorKind;
use std::sync::Arc;

use chunkferry_protocol::{CheckStatus, FileStatus};
use chunkferry_transfer::fingerprint;
use tracing::{info, warn};

use crate::{RecordLocks, RecordStore, StoreConfig, StoreError};

/// Spot-checks merged files against their recorded fingerprint.
pub struct IntegrityChecker {
    config: Arc<StoreConfig>,
    records: Arc<dyn RecordStore>,
    locks: Arc<RecordLocks>,
}

impl IntegrityChecker {
    pub fn new(
        config: Arc<StoreConfig>,
        records: Arc<dyn RecordStore>,
        locks: Arc<RecordLocks>,
    ) -> Self {
        Self {
            config,
            records,
            locks,
        }
    }

    /// Re-hashes the fingerprint windows of record `id` and stores the verdict.
    pub async fn check(&self, id: u64) -> Result<CheckStatus, StoreError> {
        let record = self
            .records
            .find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))?;
        let _guard = self.locks.lock(&record.file_hash).await;
        let mut record = self
            .records
            .find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))?;

        if record.status != FileStatus::Finished {
            return Err(StoreError::Validation(format!(
                "record {id} is {}, only finished files can be checked",
                record.status
            )));
        }

        let path = self.config.file_path(&record.file_hash);
        let verdict = match tokio::fs::metadata(&path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(id, file_hash = %record.file_hash, "merged file is missing");
                CheckStatus::Failed
            }
            Err(e) => return Err(e.into()),
            Ok(meta) if meta.len() != record.size => {
                warn!(id, len = meta.len(), size = record.size, "merged file has wrong size");
                CheckStatus::Failed
            }
            Ok(_) => {
                let fp = fingerprint(&path, self.config.fingerprint_window).await?;
                if fp.start_hash == record.start_hash && fp.end_hash == record.end_hash {
                    CheckStatus::Verified
                } else {
                    warn!(id, file_hash = %record.file_hash, "fingerprint mismatch");
                    CheckStatus::Failed
                }
            }
        };

        if record.check_status != verdict {
            record.check_status = verdict;
            self.records.update(&record)?;
        }
        info!(id, verdict = ?verdict, "integrity check done");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use chunkferry_transfer::hash_bytes;

    use super::*;
    use crate::{MemoryRecordStore, NewRecord};

    const HASH: &str = "ffeeddccbbaa99887766554433221100";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Arc<StoreConfig>,
        records: Arc<MemoryRecordStore>,
        checker: IntegrityChecker,
    }

    fn fixture(window: u64) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = StoreConfig::new(dir.path());
        cfg.fingerprint_window = window;
        let config = Arc::new(cfg);
        let records = Arc::new(MemoryRecordStore::new());
        let checker = IntegrityChecker::new(
            config.clone(),
            records.clone(),
            Arc::new(RecordLocks::new()),
        );
        Fixture {
            _dir: dir,
            config,
            records,
            checker,
        }
    }

    fn seed(f: &Fixture, data: &[u8], window: usize, status: FileStatus) -> u64 {
        let mut rec = f
            .records
            .insert(NewRecord {
                filename: "a.bin".into(),
                file_hash: HASH.into(),
                start_hash: hash_bytes(&data[..window]),
                end_hash: hash_bytes(&data[data.len() - window..]),
                file_path: f.config.file_path(HASH).display().to_string(),
                size: data.len() as u64,
            })
            .unwrap();
        rec.status = status;
        f.records.update(&rec).unwrap();
        std::fs::create_dir_all(&f.config.files_dir).unwrap();
        std::fs::write(f.config.file_path(HASH), data).unwrap();
        rec.id
    }

    #[tokio::test]
    async fn intact_file_is_verified_and_persisted() {
        let f = fixture(8);
        let data: Vec<u8> = (0..40u8).collect();
        let id = seed(&f, &data, 8, FileStatus::Finished);

        assert_eq!(f.checker.check(id).await.unwrap(), CheckStatus::Verified);
        let rec = f.records.find_by_id(id).unwrap().unwrap();
        assert_eq!(rec.check_status, CheckStatus::Verified);
    }

    #[tokio::test]
    async fn corrupted_tail_fails() {
        let f = fixture(8);
        let data: Vec<u8> = (0..40u8).collect();
        let id = seed(&f, &data, 8, FileStatus::Finished);
        let mut corrupt = data.clone();
        corrupt[39] ^= 0xff;
        std::fs::write(f.config.file_path(HASH), &corrupt).unwrap();

        assert_eq!(f.checker.check(id).await.unwrap(), CheckStatus::Failed);
        let rec = f.records.find_by_id(id).unwrap().unwrap();
        assert_eq!(rec.check_status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn missing_or_truncated_file_fails() {
        let f = fixture(8);
        let data: Vec<u8> = (0..40u8).collect();
        let id = seed(&f, &data, 8, FileStatus::Finished);

        std::fs::write(f.config.file_path(HASH), &data[..39]).unwrap();
        assert_eq!(f.checker.check(id).await.unwrap(), CheckStatus::Failed);

        std::fs::remove_file(f.config.file_path(HASH)).unwrap();
        assert_eq!(f.checker.check(id).await.unwrap(), CheckStatus::Failed);
    }

    #[tokio::test]
    async fn unfinished_record_is_rejected() {
        let f = fixture(8);
        let data: Vec<u8> = (0..40u8).collect();
        let id = seed(&f, &data, 8, FileStatus::ChunkUploaded);
        assert!(matches!(
            f.checker.check(id).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.checker.check(id + 1).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
