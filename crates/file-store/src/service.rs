use std::sync::Arc;

use chunkferry_protocol::messages::{
    ListRequest, MergeRequest, UploadChunkHeader, VerifyRequest, VerifyResponse,
};
use chunkferry_protocol::{CheckStatus, FileRecord, FileStatus, Fingerprint};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    Admission, BandwidthSource, ChunkStore, DiskSpace, IntegrityChecker, MergeEngine, MergeEvent,
    RecordLocks, RecordService, RecordStore, StoreConfig, StoreError,
};

/// Server-side entry point tying records, chunks, merges and checks together.
///
/// Cheap to share behind an `Arc`; every operation is safe to call
/// concurrently from any number of connections.
pub struct FileService {
    config: Arc<StoreConfig>,
    records: RecordService,
    chunks: Arc<ChunkStore>,
    merge: Arc<MergeEngine>,
    integrity: IntegrityChecker,
    bandwidth: Arc<dyn BandwidthSource>,
}

impl FileService {
    pub fn new(
        config: StoreConfig,
        store: Arc<dyn RecordStore>,
        disk: Arc<dyn DiskSpace>,
        bandwidth: Arc<dyn BandwidthSource>,
    ) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(RecordLocks::new());
        let chunks = Arc::new(ChunkStore::new(config.clone()));
        let merge = Arc::new(MergeEngine::new(
            config.clone(),
            store.clone(),
            locks.clone(),
            chunks.clone(),
            disk,
        ));
        let records = RecordService::new(
            config.clone(),
            store.clone(),
            locks.clone(),
            chunks.clone(),
            merge.clone(),
        );
        let integrity = IntegrityChecker::new(config.clone(), store, locks);
        Self {
            config,
            records,
            chunks,
            merge,
            integrity,
            bandwidth,
        }
    }

    /// Creates the storage directories and drops part files left by a crash.
    pub async fn init(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.config.files_dir).await?;
        tokio::fs::create_dir_all(&self.config.chunks_dir).await?;
        self.chunks.purge_parts().await?;
        info!(
            files = %self.config.files_dir.display(),
            chunks = %self.config.chunks_dir.display(),
            "storage ready"
        );
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn subscribe_merge_events(&self) -> broadcast::Receiver<MergeEvent> {
        self.merge.subscribe()
    }

    pub async fn verify(&self, req: &VerifyRequest) -> Result<VerifyResponse, StoreError> {
        self.records.verify(req).await
    }

    pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<String>, StoreError> {
        self.records.lookup(fp)
    }

    pub async fn upload_chunk(
        &self,
        header: &UploadChunkHeader,
        data: &[u8],
    ) -> Result<Admission, StoreError> {
        self.chunks
            .admit(&header.file_hash, header.size, header.chunk_index, data)
            .await
    }

    pub async fn merge(&self, req: &MergeRequest) -> Result<u8, StoreError> {
        self.merge.merge(&req.file_hash, req.size).await
    }

    pub async fn cancel_merge(&self, id: u64) -> Result<(), StoreError> {
        self.merge.cancel_merge(id).await
    }

    pub async fn check(&self, id: u64) -> Result<CheckStatus, StoreError> {
        self.integrity.check(id).await
    }

    pub async fn rename(&self, id: u64, filename: &str) -> Result<(), StoreError> {
        self.records.rename(id, filename).await
    }

    pub fn detail(&self, id: u64) -> Result<FileRecord, StoreError> {
        self.records.detail(id)
    }

    pub fn list(&self, req: &ListRequest) -> Result<(usize, Vec<FileRecord>), StoreError> {
        self.records.list(req)
    }

    pub async fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.records.delete(id).await
    }

    pub async fn set_outside_download(&self, id: u64, enabled: bool) -> Result<(), StoreError> {
        self.records.set_outside_download(id, enabled).await
    }

    /// Opens the merged file of record `id` for streaming.
    pub async fn open_download(
        &self,
        id: u64,
    ) -> Result<(FileRecord, tokio::fs::File), StoreError> {
        let record = self.records.detail(id)?;
        self.open_finished(record).await
    }

    /// Opens a file published for anonymous download.
    pub async fn open_public_download(
        &self,
        filename: &str,
    ) -> Result<(FileRecord, tokio::fs::File), StoreError> {
        let record = self.records.find_public(filename)?;
        self.open_finished(record).await
    }

    async fn open_finished(
        &self,
        record: FileRecord,
    ) -> Result<(FileRecord, tokio::fs::File), StoreError> {
        if record.status != FileStatus::Finished {
            return Err(StoreError::Validation(format!(
                "record {} is {}, not downloadable",
                record.id, record.status
            )));
        }
        let path = self.config.file_path(&record.file_hash);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("file of record {} is missing", record.id))
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok((record, file))
    }

    /// Upload budget advertised to clients, bytes per second (0 = unlimited).
    pub fn upload_bandwidth(&self) -> u64 {
        self.bandwidth.upload_budget()
    }

    pub fn set_upload_bandwidth(&self, bytes_per_sec: u64) {
        info!(bytes_per_sec, "upload bandwidth changed");
        self.bandwidth.set_upload_budget(bytes_per_sec);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chunkferry_transfer::{ChunkPlan, hash_bytes};

    use super::*;
    use crate::{FixedDiskSpace, MemoryRecordStore, SharedBandwidth};

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryRecordStore>,
        service: FileService,
    }

    fn fixture(chunk_size: u64, window: u64) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = StoreConfig::new(dir.path());
        cfg.chunk_size = chunk_size;
        cfg.fingerprint_window = window;
        cfg.safety_margin = 0;
        let store = Arc::new(MemoryRecordStore::new());
        let service = FileService::new(
            cfg,
            store.clone(),
            Arc::new(FixedDiskSpace(u64::MAX)),
            Arc::new(SharedBandwidth::default()),
        );
        Fixture {
            _dir: dir,
            store,
            service,
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn verify_request(name: &str, data: &[u8], window: usize) -> VerifyRequest {
        let w = window.min(data.len());
        VerifyRequest {
            filename: name.into(),
            file_hash: hash_bytes(data),
            start_hash: hash_bytes(&data[..w]),
            end_hash: hash_bytes(&data[data.len() - w..]),
            size: data.len() as u64,
        }
    }

    fn header(req: &VerifyRequest, index: u64) -> UploadChunkHeader {
        UploadChunkHeader {
            id: String::new(),
            file_hash: req.file_hash.clone(),
            size: req.size,
            chunk_index: index,
        }
    }

    async fn upload(f: &Fixture, req: &VerifyRequest, data: &[u8], indices: &[u64]) {
        let plan = ChunkPlan::new(req.size, f.service.config().chunk_size).unwrap();
        for &i in indices {
            let span = plan.span(i).unwrap();
            f.service
                .upload_chunk(&header(req, i), &data[span.offset as usize..span.end() as usize])
                .await
                .unwrap();
        }
    }

    async fn merge_to_completion(f: &Fixture, req: &VerifyRequest) {
        let merge = MergeRequest {
            file_hash: req.file_hash.clone(),
            size: req.size,
        };
        for _ in 0..500 {
            if f.service.merge(&merge).await.unwrap() == 100 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("merge did not complete");
    }

    #[tokio::test]
    async fn resume_scenario_65_over_30() {
        // 65 units in chunks of 30: chunks 1 and 2 uploaded before a drop.
        let f = fixture(30 * 1024, 30 * 1024);
        let data = content(65 * 1024);
        let req = verify_request("movie.mkv", &data, 30 * 1024);

        let first = f.service.verify(&req).await.unwrap();
        let id = match first {
            VerifyResponse::NeedUpload { id, uploaded_list } => {
                assert!(uploaded_list.is_empty());
                id
            }
            other => panic!("unexpected {other:?}"),
        };
        upload(&f, &req, &data, &[1, 2]).await;

        let resumed = f.service.verify(&req).await.unwrap();
        assert_eq!(
            resumed,
            VerifyResponse::NeedUpload {
                id,
                uploaded_list: vec![1, 2]
            }
        );
        let json = serde_json::to_value(&resumed).unwrap();
        assert_eq!(json["uploadedList"], serde_json::json!(["1", "2"]));
        assert_eq!(f.service.detail(id).unwrap().status, FileStatus::ChunkUploading);

        upload(&f, &req, &data, &[0]).await;
        let complete = f.service.verify(&req).await.unwrap();
        assert!(matches!(complete, VerifyResponse::NeedUpload { ref uploaded_list, .. } if uploaded_list.len() == 3));
        assert_eq!(f.service.detail(id).unwrap().status, FileStatus::ChunkUploaded);

        merge_to_completion(&f, &req).await;
        let path = f.service.config().file_path(&req.file_hash);
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert_eq!(
            f.service.verify(&req).await.unwrap(),
            VerifyResponse::AlreadyComplete { id }
        );
        assert_eq!(f.service.check(id).await.unwrap(), CheckStatus::Verified);
    }

    #[tokio::test]
    async fn rename_conflict_then_confirm() {
        let f = fixture(MB, MB);
        let data = content(100);
        let original = verify_request("a.mp4", &data, MB as usize);
        let id = match f.service.verify(&original).await.unwrap() {
            VerifyResponse::NeedUpload { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };

        let renamed = VerifyRequest {
            filename: "b.mp4".into(),
            ..original.clone()
        };
        assert_eq!(
            f.service.verify(&renamed).await.unwrap(),
            VerifyResponse::RenameConflict {
                id,
                origin_filename: "a.mp4".into()
            }
        );

        f.service.rename(id, "b.mp4").await.unwrap();
        assert!(matches!(
            f.service.verify(&renamed).await.unwrap(),
            VerifyResponse::NeedUpload { .. }
        ));
    }

    #[tokio::test]
    async fn corrupt_chunk_is_purged_and_reuploaded() {
        let f = fixture(16, 16);
        let data = content(40);
        let req = verify_request("c.bin", &data, 16);
        f.service.verify(&req).await.unwrap();
        upload(&f, &req, &data, &[0, 1, 2]).await;

        // Simulate a crash that left chunk 1 short.
        let chunk = f.service.config().chunk_path(&req.file_hash, 1);
        std::fs::write(&chunk, &data[16..20]).unwrap();

        match f.service.verify(&req).await.unwrap() {
            VerifyResponse::NeedUpload { uploaded_list, .. } => {
                assert_eq!(uploaded_list, vec![0, 2])
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!chunk.exists());

        upload(&f, &req, &data, &[1]).await;
        f.service.verify(&req).await.unwrap();
        merge_to_completion(&f, &req).await;
        let merged = std::fs::read(f.service.config().file_path(&req.file_hash)).unwrap();
        assert_eq!(merged, data);
    }

    #[tokio::test]
    async fn verify_rejects_invalid_input() {
        let f = fixture(16, 16);
        let data = content(40);
        let mut req = verify_request("c.bin", &data, 16);
        req.file_hash = "xyz".into();
        assert!(matches!(
            f.service.verify(&req).await,
            Err(StoreError::Validation(_))
        ));

        let mut req = verify_request("c.bin", &data, 16);
        req.filename = "x".repeat(65);
        assert!(matches!(
            f.service.verify(&req).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn verify_adopts_complete_destination() {
        let f = fixture(16, 16);
        let data = content(40);
        let req = verify_request("c.bin", &data, 16);
        let id = match f.service.verify(&req).await.unwrap() {
            VerifyResponse::NeedUpload { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };
        std::fs::create_dir_all(&f.service.config().files_dir).unwrap();
        std::fs::write(f.service.config().file_path(&req.file_hash), &data).unwrap();
        assert_eq!(
            f.service.verify(&req).await.unwrap(),
            VerifyResponse::AlreadyComplete { id }
        );
        assert_eq!(f.service.detail(id).unwrap().status, FileStatus::Finished);
    }

    #[tokio::test]
    async fn verify_recovers_lost_merge_session() {
        let f = fixture(16, 16);
        let data = content(40);
        let req = verify_request("c.bin", &data, 16);
        let id = match f.service.verify(&req).await.unwrap() {
            VerifyResponse::NeedUpload { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };
        upload(&f, &req, &data, &[0, 1, 2]).await;

        // Status says merging but no session exists, as after a restart.
        let mut rec = f.service.detail(id).unwrap();
        rec.status = FileStatus::ChunkMerging;
        f.store.update(&rec).unwrap();
        let dest = f.service.config().file_path(&req.file_hash);
        std::fs::create_dir_all(&f.service.config().files_dir).unwrap();
        std::fs::write(&dest, vec![0u8; 40]).unwrap();

        match f.service.verify(&req).await.unwrap() {
            VerifyResponse::NeedUpload { uploaded_list, .. } => {
                assert_eq!(uploaded_list, vec![0, 1, 2])
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!dest.exists());
        assert_eq!(f.service.detail(id).unwrap().status, FileStatus::ChunkUploaded);
    }

    #[tokio::test]
    async fn lookup_list_and_delete() {
        let f = fixture(16, 16);
        let data = content(40);
        let req = verify_request("report.pdf", &data, 16);
        let id = match f.service.verify(&req).await.unwrap() {
            VerifyResponse::NeedUpload { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };
        let fp = Fingerprint {
            start_hash: req.start_hash.clone(),
            end_hash: req.end_hash.clone(),
            size: req.size,
        };
        assert_eq!(f.service.lookup(&fp).unwrap(), Some(req.file_hash.clone()));

        let (total, _) = f.service.list(&ListRequest::default()).unwrap();
        assert_eq!(total, 0, "uploading records are not listed");

        upload(&f, &req, &data, &[0, 1, 2]).await;
        f.service.verify(&req).await.unwrap();
        merge_to_completion(&f, &req).await;
        let (total, records) = f
            .service
            .list(&ListRequest {
                filename: Some("REPORT".into()),
                ..ListRequest::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].id, id);

        f.service.delete(id).await.unwrap();
        assert!(!f.service.config().file_path(&req.file_hash).exists());
        assert!(matches!(f.service.detail(id), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn public_download_requires_opt_in() {
        let f = fixture(16, 16);
        let data = content(40);
        let req = verify_request("share.zip", &data, 16);
        let id = match f.service.verify(&req).await.unwrap() {
            VerifyResponse::NeedUpload { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };
        upload(&f, &req, &data, &[0, 1, 2]).await;
        f.service.verify(&req).await.unwrap();
        merge_to_completion(&f, &req).await;

        assert!(f.service.open_download(id).await.is_ok());
        assert!(matches!(
            f.service.open_public_download("share.zip").await,
            Err(StoreError::NotFound(_))
        ));
        f.service.set_outside_download(id, true).await.unwrap();
        let (record, _file) = f.service.open_public_download("share.zip").await.unwrap();
        assert_eq!(record.id, id);
    }

    #[tokio::test]
    async fn init_drops_stale_part_files() {
        let f = fixture(10, 10);
        let data = content(25);
        let req = verify_request("data.bin", &data, 10);
        upload(&f, &req, &data, &[0]).await;
        let chunk_dir = f.service.config().chunk_dir(&req.file_hash);
        let stale = chunk_dir.join("1.part-deadbeef");
        std::fs::write(&stale, b"half").unwrap();

        f.service.init().await.unwrap();
        assert!(!stale.exists());
        assert!(f.service.config().chunk_path(&req.file_hash, 0).exists());
    }

    #[test]
    fn bandwidth_round_trips_through_source() {
        let f = fixture(16, 16);
        assert_eq!(f.service.upload_bandwidth(), 0);
        f.service.set_upload_bandwidth(512 * 1024);
        assert_eq!(f.service.upload_bandwidth(), 512 * 1024);
    }
}
