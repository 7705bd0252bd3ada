//! Persistence seam for file records.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use chunkferry_protocol::{CheckStatus, FileRecord, FileStatus, Fingerprint};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StoreError;

/// Fields supplied when a content hash is seen for the first time.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub filename: String,
    pub file_hash: String,
    pub start_hash: String,
    pub end_hash: String,
    pub file_path: String,
    pub size: u64,
}

/// Filter and paging for [`RecordStore::list`].
#[derive(Debug, Clone)]
pub struct RecordQuery {
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    /// Case-insensitive substring match on the filename.
    pub filename: Option<String>,
}

/// Catalog of file records.
///
/// Implementations must keep `file_hash` unique and assign ids monotonically.
/// Callers serialize per-hash transitions with [`RecordLocks`](crate::RecordLocks).
pub trait RecordStore: Send + Sync {
    fn find_by_hash(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError>;
    fn find_by_id(&self, id: u64) -> Result<Option<FileRecord>, StoreError>;
    fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<FileRecord>, StoreError>;
    /// Most recent record with this exact filename.
    fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError>;
    fn insert(&self, new: NewRecord) -> Result<FileRecord, StoreError>;
    /// Replaces the stored record with the same id.
    fn update(&self, record: &FileRecord) -> Result<(), StoreError>;
    fn remove(&self, id: u64) -> Result<Option<FileRecord>, StoreError>;
    /// Records past the uploading phase, newest first, plus the unpaged total.
    fn list(&self, query: &RecordQuery) -> Result<(usize, Vec<FileRecord>), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordTable {
    next_id: u64,
    records: Vec<FileRecord>,
}

impl RecordTable {
    fn find_by_hash(&self, file_hash: &str) -> Option<FileRecord> {
        self.records.iter().find(|r| r.file_hash == file_hash).cloned()
    }

    fn find_by_id(&self, id: u64) -> Option<FileRecord> {
        self.records.iter().find(|r| r.id == id).cloned()
    }

    fn find_by_fingerprint(&self, fp: &Fingerprint) -> Option<FileRecord> {
        self.records
            .iter()
            .find(|r| r.start_hash == fp.start_hash && r.end_hash == fp.end_hash && r.size == fp.size)
            .cloned()
    }

    fn find_by_filename(&self, filename: &str) -> Option<FileRecord> {
        self.records
            .iter()
            .filter(|r| r.filename == filename)
            .max_by_key(|r| r.id)
            .cloned()
    }

    fn insert(&mut self, new: NewRecord) -> Result<FileRecord, StoreError> {
        if self.records.iter().any(|r| r.file_hash == new.file_hash) {
            return Err(StoreError::Record(format!(
                "record for {} already exists",
                new.file_hash
            )));
        }
        self.next_id += 1;
        let now = Utc::now();
        let record = FileRecord {
            id: self.next_id,
            filename: new.filename,
            file_hash: new.file_hash,
            start_hash: new.start_hash,
            end_hash: new.end_hash,
            file_path: new.file_path,
            size: new.size,
            status: FileStatus::Init,
            check_status: CheckStatus::Unchecked,
            outside_download: false,
            created_at: now,
            updated_at: now,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    fn update(&mut self, record: &FileRecord) -> Result<(), StoreError> {
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", record.id)))?;
        *slot = record.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    fn remove(&mut self, id: u64) -> Option<FileRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    fn list(&self, query: &RecordQuery) -> (usize, Vec<FileRecord>) {
        let needle = query.filename.as_deref().map(str::to_lowercase);
        let mut matching: Vec<&FileRecord> = self
            .records
            .iter()
            .filter(|r| !matches!(r.status, FileStatus::Init | FileStatus::ChunkUploading))
            .filter(|r| match &needle {
                Some(n) => r.filename.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| b.id.cmp(&a.id));

        let total = matching.len();
        let page_size = query.page_size.max(1) as usize;
        let skip = (query.page.max(1) as usize - 1) * page_size;
        let page = matching
            .into_iter()
            .skip(skip)
            .take(page_size)
            .cloned()
            .collect();
        (total, page)
    }
}

/// Volatile record store, used by tests and throwaway servers.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    table: Mutex<RecordTable>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, RecordTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RecordStore for MemoryRecordStore {
    fn find_by_hash(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_hash(file_hash))
    }

    fn find_by_id(&self, id: u64) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_id(id))
    }

    fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_fingerprint(fp))
    }

    fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_filename(filename))
    }

    fn insert(&self, new: NewRecord) -> Result<FileRecord, StoreError> {
        self.table().insert(new)
    }

    fn update(&self, record: &FileRecord) -> Result<(), StoreError> {
        self.table().update(record)
    }

    fn remove(&self, id: u64) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().remove(id))
    }

    fn list(&self, query: &RecordQuery) -> Result<(usize, Vec<FileRecord>), StoreError> {
        Ok(self.table().list(query))
    }
}

/// Record store persisted as a single JSON document.
///
/// Every mutation rewrites the document through a temporary file and a
/// rename, so a crash leaves either the old or the new table on disk. A
/// mutation that fails to persist is not applied in memory either.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    table: Mutex<RecordTable>,
}

impl JsonRecordStore {
    /// Loads the table at `path`, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let table = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecordTable::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), records = table.records.len(), "record table loaded");
        Ok(Self {
            path: path.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    fn table(&self) -> MutexGuard<'_, RecordTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, table: &RecordTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RecordTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut table = self.table();
        let mut next = table.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *table = next;
        Ok(out)
    }
}

impl RecordStore for JsonRecordStore {
    fn find_by_hash(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_hash(file_hash))
    }

    fn find_by_id(&self, id: u64) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_id(id))
    }

    fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_fingerprint(fp))
    }

    fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table().find_by_filename(filename))
    }

    fn insert(&self, new: NewRecord) -> Result<FileRecord, StoreError> {
        self.mutate(|t| t.insert(new))
    }

    fn update(&self, record: &FileRecord) -> Result<(), StoreError> {
        self.mutate(|t| t.update(record))
    }

    fn remove(&self, id: u64) -> Result<Option<FileRecord>, StoreError> {
        self.mutate(|t| Ok(t.remove(id)))
    }

    fn list(&self, query: &RecordQuery) -> Result<(usize, Vec<FileRecord>), StoreError> {
        Ok(self.table().list(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(n: u8, filename: &str) -> NewRecord {
        let hash = format!("{:032x}", n);
        NewRecord {
            filename: filename.into(),
            file_hash: hash.clone(),
            start_hash: format!("{:032x}", n as u32 + 1000),
            end_hash: format!("{:032x}", n as u32 + 2000),
            file_path: format!("/files/{hash}"),
            size: 100 + n as u64,
        }
    }

    fn query(page: u32, page_size: u32, filename: Option<&str>) -> RecordQuery {
        RecordQuery {
            page,
            page_size,
            filename: filename.map(String::from),
        }
    }

    #[test]
    fn insert_assigns_monotonic_ids() {
        let store = MemoryRecordStore::new();
        let a = store.insert(new_record(1, "a.bin")).unwrap();
        let b = store.insert(new_record(2, "b.bin")).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(a.status, FileStatus::Init);
        store.remove(b.id).unwrap();
        let c = store.insert(new_record(3, "c.bin")).unwrap();
        assert_eq!(c.id, 3);
    }

    #[test]
    fn duplicate_hash_is_rejected() {
        let store = MemoryRecordStore::new();
        store.insert(new_record(1, "a.bin")).unwrap();
        assert!(matches!(
            store.insert(new_record(1, "again.bin")),
            Err(StoreError::Record(_))
        ));
    }

    #[test]
    fn finds_by_fingerprint() {
        let store = MemoryRecordStore::new();
        let rec = store.insert(new_record(5, "a.bin")).unwrap();
        let fp = Fingerprint {
            start_hash: rec.start_hash.clone(),
            end_hash: rec.end_hash.clone(),
            size: rec.size,
        };
        assert_eq!(store.find_by_fingerprint(&fp).unwrap().unwrap().id, rec.id);

        let other = Fingerprint { size: 1, ..fp };
        assert!(store.find_by_fingerprint(&other).unwrap().is_none());
    }

    #[test]
    fn list_skips_uploading_records_and_pages() {
        let store = MemoryRecordStore::new();
        for n in 1..=5u8 {
            let mut rec = store.insert(new_record(n, &format!("clip-{n}.mp4"))).unwrap();
            if n != 3 {
                rec.status = FileStatus::Finished;
                store.update(&rec).unwrap();
            }
        }

        let (total, page) = store.list(&query(1, 2, None)).unwrap();
        assert_eq!(total, 4);
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 4]);

        let (_, page) = store.list(&query(2, 2, None)).unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);

        let (total, page) = store.list(&query(1, 10, Some("CLIP-2"))).unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].id, 2);
    }

    #[test]
    fn update_unknown_record_is_not_found() {
        let store = MemoryRecordStore::new();
        let mut rec = store.insert(new_record(1, "a.bin")).unwrap();
        rec.id = 99;
        assert!(matches!(store.update(&rec), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db").join("records.json");

        {
            let store = JsonRecordStore::open(&path).unwrap();
            let mut rec = store.insert(new_record(1, "a.bin")).unwrap();
            rec.status = FileStatus::Finished;
            store.update(&rec).unwrap();
            store.insert(new_record(2, "b.bin")).unwrap();
        }

        let store = JsonRecordStore::open(&path).unwrap();
        let rec = store.find_by_id(1).unwrap().unwrap();
        assert_eq!(rec.status, FileStatus::Finished);
        let next = store.insert(new_record(3, "c.bin")).unwrap();
        assert_eq!(next.id, 3);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_the_table_unchanged() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.json");
        let store = JsonRecordStore::open(&path).unwrap();
        let rec = store.insert(new_record(1, "a.bin")).unwrap();

        // A directory in place of the temporary file makes every write fail.
        let tmp = path.with_extension("json.tmp");
        std::fs::create_dir(&tmp).unwrap();

        assert!(store.insert(new_record(2, "b.bin")).is_err());
        assert!(store.find_by_hash(&format!("{:032x}", 2)).unwrap().is_none());
        let renamed = FileRecord {
            filename: "z.bin".into(),
            ..rec.clone()
        };
        assert!(store.update(&renamed).is_err());
        assert_eq!(store.find_by_id(rec.id).unwrap().unwrap().filename, "a.bin");
        assert!(store.remove(rec.id).is_err());
        assert!(store.find_by_id(rec.id).unwrap().is_some());

        std::fs::remove_dir(&tmp).unwrap();
        let next = store.insert(new_record(2, "b.bin")).unwrap();
        assert_eq!(next.id, 2);
        let reopened = JsonRecordStore::open(&path).unwrap();
        assert_eq!(reopened.find_by_id(1).unwrap().unwrap().filename, "a.bin");
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonRecordStore::open(&path),
            Err(StoreError::Record(_))
        ));
    }
}
