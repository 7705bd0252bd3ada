//! Upload orchestration.
//!
//! Drives one file through fingerprinting, hash resolution, verify, chunk
//! transfer, re-verify and merge, reporting progress as [`UploadEvent`]s.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkferry_protocol::Fingerprint;
use chunkferry_protocol::constants::QUICK_LOOKUP_THRESHOLD;
use chunkferry_protocol::messages::{UploadChunkHeader, VerifyRequest, VerifyResponse};
use chunkferry_protocol::transfer::TransferTarget;
use chunkferry_transfer::{
    ChunkPlan, ChunkProgress, ChunkReader, ChunkSpan, FingerprintCache, TransferError,
    fingerprint, hash_file, validate_filename,
};

use crate::types::{ConflictPolicy, HashSource, UploadEvent, UploadMode, UploadOptions, UploadOutcome};
use crate::{ControlClient, Endpoint, TransferEvent, TransferGate, TransferPool, UploadError};

/// Concurrent `upload_chunk` requests in control mode.
pub const CONTROL_CONCURRENCY: usize = 6;

/// Transfer attempts before giving up on chunks the server still lacks.
const MAX_TRANSFER_ROUNDS: usize = 3;

const MERGE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Uploads files to one server.
pub struct Uploader {
    client: Arc<ControlClient>,
    endpoint: Endpoint,
    gate: TransferGate,
    cache: Mutex<FingerprintCache>,
    active_pool: Mutex<Option<Arc<TransferPool>>>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

enum Verified {
    Complete { id: u64 },
    Missing { id: u64, uploaded: Vec<u64> },
}

impl Uploader {
    pub fn new(client: Arc<ControlClient>, endpoint: Endpoint) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            client,
            endpoint,
            gate: TransferGate::global().clone(),
            cache: Mutex::new(FingerprintCache::default()),
            active_pool: Mutex::new(None),
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Opens the control channel and builds an uploader on it.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, UploadError> {
        let client = ControlClient::connect(&endpoint).await?;
        Ok(Self::new(Arc::new(client), endpoint))
    }

    /// Uses `gate` instead of the process-wide one.
    pub fn with_gate(mut self, gate: TransferGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn client(&self) -> &Arc<ControlClient> {
        &self.client
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pauses the running streamed transfer. Returns `false` if none is running.
    pub fn pause(&self) -> bool {
        self.with_pool(TransferPool::pause)
    }

    pub fn resume(&self) -> bool {
        self.with_pool(TransferPool::resume)
    }

    /// Changes the budget of the running streamed transfer.
    pub fn set_budget(&self, bytes_per_sec: u64) -> bool {
        self.with_pool(|pool| pool.set_budget(bytes_per_sec))
    }

    fn with_pool(&self, f: impl FnOnce(&TransferPool)) -> bool {
        let active = self.active_pool.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_deref() {
            Some(pool) => {
                f(pool);
                true
            }
            None => false,
        }
    }

    /// Uploads `path` and returns once the server holds the merged file.
    pub async fn upload(
        &self,
        path: &Path,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, UploadError> {
        let _permit = match options.mode {
            UploadMode::Streamed => Some(self.gate.try_acquire()?),
            UploadMode::Control => None,
        };
        self.check_cancelled()?;

        let filename = match &options.filename {
            Some(name) => name.clone(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        validate_filename(&filename)?;

        let fp = fingerprint(path, options.fingerprint_window).await?;
        let plan = ChunkPlan::new(fp.size, options.chunk_size)?;
        let file_hash = self.resolve_hash(path, &fp, options).await?;
        self.check_cancelled()?;

        let mut req = VerifyRequest {
            filename,
            file_hash: file_hash.clone(),
            start_hash: fp.start_hash.clone(),
            end_hash: fp.end_hash.clone(),
            size: fp.size,
        };
        let (id, mut uploaded) = match self.verify(&mut req, options.conflict).await? {
            Verified::Complete { id } => {
                info!(id, file_hash = %file_hash, "server already has the file");
                self.emit(UploadEvent::Completed { id });
                return Ok(UploadOutcome {
                    id,
                    file_hash,
                    filename: req.filename,
                    size: fp.size,
                    uploaded_chunks: 0,
                    deduplicated: true,
                });
            }
            Verified::Missing { id, uploaded } => (id, uploaded),
        };

        let mut uploaded_chunks = 0;
        for round in 1..=MAX_TRANSFER_ROUNDS {
            let missing = plan.remaining(&uploaded);
            self.emit(UploadEvent::Verified {
                id,
                missing: missing.len(),
            });
            if missing.is_empty() {
                break;
            }
            if round > 1 {
                warn!(id, round, missing = missing.len(), "server still lacks chunks, retrying");
            }

            let already: u64 = uploaded.iter().filter_map(|&i| plan.expected_len(i)).sum();
            uploaded_chunks += match options.mode {
                UploadMode::Control => {
                    self.transfer_control(path, &plan, &file_hash, missing, already)
                        .await?
                }
                UploadMode::Streamed => {
                    self.transfer_streamed(path, &plan, &file_hash, missing, already, options)
                        .await?
                }
            };

            match self.verify(&mut req, options.conflict).await? {
                Verified::Complete { .. } => {
                    uploaded = (0..plan.chunk_count()).collect();
                }
                Verified::Missing { uploaded: now, .. } => uploaded = now,
            }
        }
        let remaining = plan.remaining(&uploaded).len();
        if remaining > 0 {
            return Err(UploadError::Incomplete { remaining });
        }

        self.merge(id, &file_hash, fp.size).await?;
        info!(id, file_hash = %file_hash, chunks = uploaded_chunks, "upload complete");
        self.emit(UploadEvent::Completed { id });
        Ok(UploadOutcome {
            id,
            file_hash,
            filename: req.filename,
            size: fp.size,
            uploaded_chunks,
            deduplicated: false,
        })
    }

    /// Content hash for `fp`: cache, then server lookup for larger files,
    /// then a full local hash.
    async fn resolve_hash(
        &self,
        path: &Path,
        fp: &Fingerprint,
        options: &UploadOptions,
    ) -> Result<String, UploadError> {
        if fp.size > QUICK_LOOKUP_THRESHOLD {
            if let Some(hash) = self.cached_hash(fp) {
                return Ok(self.resolved(hash, HashSource::Cache));
            }
            match self.client.lookup(fp).await {
                Ok(Some(hash)) => {
                    self.remember(fp, &hash);
                    return Ok(self.resolved(hash, HashSource::Server));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "fingerprint lookup failed, hashing locally"),
            }
        }

        let (progress_tx, mut progress_rx) = watch::channel(0u8);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let percentage = *progress_rx.borrow_and_update();
                let _ = events.try_send(UploadEvent::Hashing { percentage });
            }
        });

        let hash = hash_file(path, Some(progress_tx), &self.cancel, options.hash_timeout)
            .await
            .map_err(|e| match e {
                TransferError::Cancelled => UploadError::Cancelled,
                e => e.into(),
            })?;
        self.remember(fp, &hash);
        Ok(self.resolved(hash, HashSource::Computed))
    }

    fn cached_hash(&self, fp: &Fingerprint) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fp)
    }

    fn remember(&self, fp: &Fingerprint, hash: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fp.clone(), hash.to_string());
    }

    fn resolved(&self, file_hash: String, source: HashSource) -> String {
        debug!(file_hash = %file_hash, ?source, "content hash resolved");
        self.emit(UploadEvent::HashResolved {
            file_hash: file_hash.clone(),
            source,
        });
        file_hash
    }

    /// Verifies `req`, settling a rename conflict according to `policy`.
    async fn verify(
        &self,
        req: &mut VerifyRequest,
        policy: ConflictPolicy,
    ) -> Result<Verified, UploadError> {
        let mut resp = self.client.verify(req).await?;
        if let VerifyResponse::RenameConflict {
            id,
            origin_filename,
        } = resp
        {
            match policy {
                ConflictPolicy::Abort => {
                    return Err(UploadError::RenameConflict {
                        id,
                        origin_filename,
                    });
                }
                ConflictPolicy::Rename => {
                    info!(id, from = %origin_filename, to = %req.filename, "renaming stored record");
                    self.client.rename(id, &req.filename).await?;
                }
                ConflictPolicy::KeepExisting => {
                    debug!(id, filename = %origin_filename, "keeping stored filename");
                    req.filename = origin_filename;
                }
            }
            resp = self.client.verify(req).await?;
        }

        match resp {
            VerifyResponse::AlreadyComplete { id } => Ok(Verified::Complete { id }),
            VerifyResponse::NeedUpload { id, uploaded_list } => Ok(Verified::Missing {
                id,
                uploaded: uploaded_list,
            }),
            VerifyResponse::RenameConflict { id, .. } => Err(UploadError::UnexpectedResponse(
                format!("rename conflict persists for record {id}"),
            )),
        }
    }

    /// Sends `missing` as `upload_chunk` requests, [`CONTROL_CONCURRENCY`]
    /// at a time.
    async fn transfer_control(
        &self,
        path: &Path,
        plan: &ChunkPlan,
        file_hash: &str,
        missing: Vec<ChunkSpan>,
        already: u64,
    ) -> Result<usize, UploadError> {
        let reader = tokio::sync::Mutex::new(ChunkReader::open(path, plan.chunk_size()).await?);
        let progress = Mutex::new(ChunkProgress::new(plan.file_size(), already));
        let (reader, progress) = (&reader, &progress);

        let mut uploads = futures_util::stream::iter(missing)
            .map(|span| async move {
                self.check_cancelled()?;
                let data = reader.lock().await.read_span(&span).await?;
                let header = UploadChunkHeader {
                    id: String::new(),
                    file_hash: file_hash.to_string(),
                    size: plan.file_size(),
                    chunk_index: span.index,
                };
                let resp = self.client.upload_chunk(&header, &data).await?;
                if !resp.accepted {
                    return Err(UploadError::UnexpectedResponse(format!(
                        "chunk {} was not accepted",
                        span.index
                    )));
                }
                debug!(index = span.index, duplicate = resp.duplicate, "chunk uploaded");

                let (transferred, percentage) = {
                    let mut progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
                    progress.set(span.index, span.len);
                    (progress.transferred(), progress.percentage())
                };
                self.emit(UploadEvent::Transferring {
                    transferred,
                    percentage,
                });
                Ok::<_, UploadError>(())
            })
            .buffer_unordered(CONTROL_CONCURRENCY);

        let mut stored = 0;
        while let Some(result) = uploads.next().await {
            result?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Streams `missing` through a [`TransferPool`].
    async fn transfer_streamed(
        &self,
        path: &Path,
        plan: &ChunkPlan,
        file_hash: &str,
        missing: Vec<ChunkSpan>,
        already: u64,
        options: &UploadOptions,
    ) -> Result<usize, UploadError> {
        let budget = match options.budget {
            Some(budget) => budget,
            None => self.client.get_config().await?.upload_bandwidth,
        };
        let target = TransferTarget {
            file_hash: file_hash.to_string(),
            size: plan.file_size(),
        };
        let pool = Arc::new(TransferPool::new(
            self.endpoint.clone(),
            path,
            target,
            plan.chunk_size(),
            budget,
        ));
        *self.active_pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&pool));

        let (tx, mut rx) = mpsc::channel(256);
        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let TransferEvent::Progress {
                    transferred,
                    percentage,
                } = event
                {
                    let _ = events.try_send(UploadEvent::Transferring {
                        transferred,
                        percentage,
                    });
                }
            }
        });

        let run = pool.run(missing, already, tx);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            _ = self.cancel.cancelled() => {
                pool.cancel();
                run.await
            }
        };
        *self.active_pool.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let _ = forwarder.await;

        Ok(result?.stored_chunks)
    }

    /// Starts the merge and polls it to 100%. Cancelling the upload while
    /// merging cancels the merge on the server.
    async fn merge(&self, id: u64, file_hash: &str, size: u64) -> Result<(), UploadError> {
        loop {
            if self.cancel.is_cancelled() {
                if let Err(e) = self.client.cancel_merge(id).await {
                    debug!(id, error = %e, "cancel merge failed");
                }
                return Err(UploadError::Cancelled);
            }
            let percentage = self.client.merge(file_hash, size).await?;
            self.emit(UploadEvent::Merging { percentage });
            if percentage >= 100 {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(MERGE_POLL_INTERVAL) => {}
            }
        }
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chunkferry_protocol::FileStatus;
    use chunkferry_transfer::hash_bytes;

    use super::*;
    use crate::testing::TestServer;

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn options(mode: UploadMode) -> UploadOptions {
        UploadOptions {
            mode,
            budget: Some(0),
            chunk_size: 10,
            fingerprint_window: 10,
            ..UploadOptions::default()
        }
    }

    async fn uploader(server: &TestServer) -> Uploader {
        Uploader::connect(server.endpoint())
            .await
            .unwrap()
            .with_gate(TransferGate::new())
    }

    async fn merged_bytes(server: &TestServer, id: u64) -> Vec<u8> {
        let record = server.files.detail(id).unwrap();
        assert_eq!(record.status, FileStatus::Finished);
        tokio::fs::read(&record.file_path).await.unwrap()
    }

    #[tokio::test]
    async fn streamed_upload_end_to_end() {
        let server = TestServer::start(10).await;
        let data = payload(65, 1);
        let path = server.write_file("movie.bin", &data);
        let mut uploader = uploader(&server).await;
        let mut events = uploader.take_events().unwrap();

        let outcome = uploader
            .upload(&path, &options(UploadMode::Streamed))
            .await
            .unwrap();
        assert_eq!(outcome.file_hash, hash_bytes(&data));
        assert_eq!(outcome.filename, "movie.bin");
        assert_eq!(outcome.uploaded_chunks, 7);
        assert!(!outcome.deduplicated);
        assert_eq!(merged_bytes(&server, outcome.id).await, data);

        let mut saw_merge = false;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                UploadEvent::Merging { percentage: 100 } => saw_merge = true,
                UploadEvent::Completed { id } => completed = id == outcome.id,
                _ => {}
            }
        }
        assert!(saw_merge);
        assert!(completed);
    }

    #[tokio::test]
    async fn control_upload_end_to_end() {
        let server = TestServer::start(10).await;
        let data = payload(95, 2);
        let path = server.write_file("report.pdf", &data);
        let uploader = uploader(&server).await;

        let outcome = uploader
            .upload(&path, &options(UploadMode::Control))
            .await
            .unwrap();
        assert_eq!(outcome.uploaded_chunks, 10);
        assert_eq!(merged_bytes(&server, outcome.id).await, data);
    }

    #[tokio::test]
    async fn second_upload_is_deduplicated() {
        let server = TestServer::start(10).await;
        let data = payload(42, 3);
        let path = server.write_file("a.bin", &data);
        let uploader = uploader(&server).await;

        let first = uploader
            .upload(&path, &options(UploadMode::Control))
            .await
            .unwrap();
        let second = uploader
            .upload(&path, &options(UploadMode::Streamed))
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.id, first.id);
        assert_eq!(second.uploaded_chunks, 0);
    }

    #[tokio::test]
    async fn resumes_from_chunks_already_on_the_server() {
        let server = TestServer::start(10).await;
        let data = payload(30, 4);
        let path = server.write_file("resume.bin", &data);
        let uploader = uploader(&server).await;

        let fp = fingerprint(&path, 10).await.unwrap();
        let file_hash = hash_bytes(&data);
        uploader
            .client()
            .verify(&VerifyRequest {
                filename: "resume.bin".into(),
                file_hash: file_hash.clone(),
                start_hash: fp.start_hash,
                end_hash: fp.end_hash,
                size: 30,
            })
            .await
            .unwrap();
        let header = UploadChunkHeader {
            id: String::new(),
            file_hash,
            size: 30,
            chunk_index: 1,
        };
        uploader
            .client()
            .upload_chunk(&header, &data[10..20])
            .await
            .unwrap();

        let outcome = uploader
            .upload(&path, &options(UploadMode::Streamed))
            .await
            .unwrap();
        assert_eq!(outcome.uploaded_chunks, 2);
        assert_eq!(merged_bytes(&server, outcome.id).await, data);
    }

    #[tokio::test]
    async fn rename_conflict_policies() {
        let server = TestServer::start(10).await;
        let data = payload(25, 5);
        let original = server.write_file("original.bin", &data);
        let copy = server.write_file("copy.bin", &data);
        let uploader = uploader(&server).await;

        let first = uploader
            .upload(&original, &options(UploadMode::Control))
            .await
            .unwrap();

        let err = uploader
            .upload(&copy, &options(UploadMode::Control))
            .await
            .unwrap_err();
        match err {
            UploadError::RenameConflict {
                id,
                origin_filename,
            } => {
                assert_eq!(id, first.id);
                assert_eq!(origin_filename, "original.bin");
            }
            other => panic!("unexpected {other:?}"),
        }

        let kept = uploader
            .upload(
                &copy,
                &UploadOptions {
                    conflict: ConflictPolicy::KeepExisting,
                    ..options(UploadMode::Control)
                },
            )
            .await
            .unwrap();
        assert_eq!(kept.filename, "original.bin");
        assert!(kept.deduplicated);

        let renamed = uploader
            .upload(
                &copy,
                &UploadOptions {
                    conflict: ConflictPolicy::Rename,
                    ..options(UploadMode::Control)
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.filename, "copy.bin");
        assert_eq!(server.files.detail(first.id).unwrap().filename, "copy.bin");
    }

    #[tokio::test]
    async fn busy_gate_rejects_streamed_uploads_only() {
        let server = TestServer::start(10).await;
        let data = payload(20, 6);
        let path = server.write_file("gate.bin", &data);
        let gate = TransferGate::new();
        let uploader = Uploader::connect(server.endpoint())
            .await
            .unwrap()
            .with_gate(gate.clone());

        let _held = gate.try_acquire().unwrap();
        let err = uploader
            .upload(&path, &options(UploadMode::Streamed))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TransferBusy));

        uploader
            .upload(&path, &options(UploadMode::Control))
            .await
            .unwrap();
    }

    fn hash_sources(events: &mut mpsc::Receiver<UploadEvent>) -> Vec<HashSource> {
        let mut sources = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::HashResolved { source, .. } = event {
                sources.push(source);
            }
        }
        sources
    }

    #[tokio::test]
    async fn large_files_resolve_hash_from_cache_or_server() {
        const CHUNK: u64 = 64 * 1024;
        let server = TestServer::start(CHUNK).await;
        let data = payload(QUICK_LOOKUP_THRESHOLD as usize + 1, 7);
        let path = server.write_file("large.bin", &data);
        let opts = UploadOptions {
            mode: UploadMode::Control,
            chunk_size: CHUNK,
            fingerprint_window: CHUNK,
            ..UploadOptions::default()
        };

        let mut first = uploader(&server).await;
        let mut events = first.take_events().unwrap();
        let outcome = first.upload(&path, &opts).await.unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(hash_sources(&mut events), vec![HashSource::Computed]);

        // Same uploader again: the local cache answers.
        first.upload(&path, &opts).await.unwrap();
        assert_eq!(hash_sources(&mut events), vec![HashSource::Cache]);

        // Fresh uploader: the server knows the fingerprint.
        let mut second = uploader(&server).await;
        let mut events = second.take_events().unwrap();
        let outcome = second.upload(&path, &opts).await.unwrap();
        assert!(outcome.deduplicated);
        assert_eq!(hash_sources(&mut events), vec![HashSource::Server]);
    }

    #[tokio::test]
    async fn cancelled_upload_stops_early() {
        let server = TestServer::start(10).await;
        let path = server.write_file("c.bin", &payload(20, 8));
        let uploader = uploader(&server).await;
        uploader.cancel_token().cancel();

        let err = uploader
            .upload(&path, &options(UploadMode::Control))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }

    #[tokio::test]
    async fn pool_controls_need_a_running_transfer() {
        let server = TestServer::start(10).await;
        let uploader = uploader(&server).await;
        assert!(!uploader.pause());
        assert!(!uploader.resume());
        assert!(!uploader.set_budget(1024));
    }
}
