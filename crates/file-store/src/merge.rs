//! Background merge of stored chunks into the final file.
//!
//! A merge is started by [`MergeEngine::merge`] and runs on a fixed pool of
//! workers that pull chunk jobs from a shared queue and write each chunk at
//! `index * chunk_size` into one shared destination handle. The destination
//! never becomes `Finished` unless every chunk was written and its length
//! matches. When a merge stops early the destination is cut back to the
//! contiguous prefix of chunks that were fully written, so a later merge can
//! only see a hole-free prefix.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chunkferry_protocol::FileStatus;
use chunkferry_transfer::{ChunkPlan, validate_file_hash, validate_size};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ChunkStore, DiskSpace, MergeFailure, RecordLocks, RecordStore, StoreConfig, StoreError,
};

/// Bytes written per positional write; cancellation is checked between slices.
const WRITE_SLICE: usize = 4 * 1024 * 1024;

const EVENT_CAPACITY: usize = 256;

/// Merge lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEvent {
    Started {
        id: u64,
        file_hash: String,
        chunk_count: u64,
    },
    Progress {
        id: u64,
        file_hash: String,
        percentage: u8,
    },
    Finished {
        id: u64,
        file_hash: String,
    },
    Failed {
        id: u64,
        file_hash: String,
        failure: MergeFailure,
    },
    Cancelled {
        id: u64,
        file_hash: String,
    },
}

/// One running merge.
#[derive(Debug)]
struct MergeSession {
    session_id: Uuid,
    record_id: u64,
    file_hash: String,
    chunk_count: u64,
    finished: Mutex<HashSet<u64>>,
    cancel: CancellationToken,
    handle: Mutex<Option<Arc<std::fs::File>>>,
}

impl MergeSession {
    fn handle(&self) -> Option<Arc<std::fs::File>> {
        lock(&self.handle).clone()
    }

    fn drop_handle(&self) {
        lock(&self.handle).take();
    }

    fn mark_finished(&self, index: u64) -> u8 {
        let mut finished = lock(&self.finished);
        finished.insert(index);
        percentage(finished.len() as u64, self.chunk_count)
    }

    /// Number of leading chunks that are fully written.
    fn finished_prefix(&self) -> u64 {
        let finished = lock(&self.finished);
        (0..self.chunk_count)
            .take_while(|i| finished.contains(i))
            .count() as u64
    }

    /// Progress while the job is still running; 100 is reserved for `Finished`.
    fn percentage(&self) -> u8 {
        let done = lock(&self.finished).len() as u64;
        percentage(done, self.chunk_count).min(99)
    }
}

fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sessions by record id.
#[derive(Debug, Default)]
struct MergeRegistry {
    active: HashMap<u64, Arc<MergeSession>>,
    /// Cancelled sessions whose workers have not exited yet.
    draining: HashMap<u64, Arc<MergeSession>>,
    /// Failures of background jobs not yet reported to a caller.
    failures: HashMap<u64, MergeFailure>,
}

/// Owns merge sessions and runs merge jobs.
pub struct MergeEngine {
    config: Arc<StoreConfig>,
    records: Arc<dyn RecordStore>,
    locks: Arc<RecordLocks>,
    chunks: Arc<ChunkStore>,
    disk: Arc<dyn DiskSpace>,
    registry: Mutex<MergeRegistry>,
    events: broadcast::Sender<MergeEvent>,
}

impl MergeEngine {
    pub fn new(
        config: Arc<StoreConfig>,
        records: Arc<dyn RecordStore>,
        locks: Arc<RecordLocks>,
        chunks: Arc<ChunkStore>,
        disk: Arc<dyn DiskSpace>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            records,
            locks,
            chunks,
            disk,
            registry: Mutex::new(MergeRegistry::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MergeEvent> {
        self.events.subscribe()
    }

    /// Whether a merge session is registered for `record_id`.
    pub fn is_active(&self, record_id: u64) -> bool {
        lock(&self.registry).active.contains_key(&record_id)
    }

    /// Whether a merge is registered or a cancelled one is still draining.
    pub fn is_busy(&self, record_id: u64) -> bool {
        let registry = lock(&self.registry);
        registry.active.contains_key(&record_id) || registry.draining.contains_key(&record_id)
    }

    /// Progress of the registered session, if any.
    pub fn progress(&self, record_id: u64) -> Option<u8> {
        lock(&self.registry)
            .active
            .get(&record_id)
            .map(|s| s.percentage())
    }

    /// Starts or polls the merge of `file_hash`, returning a percentage.
    ///
    /// Returns 0 when a new job was started and 100 once the file is
    /// `Finished`. Safe to call repeatedly.
    pub async fn merge(self: &Arc<Self>, file_hash: &str, size: u64) -> Result<u8, StoreError> {
        validate_file_hash(file_hash)?;
        validate_size(size)?;
        let _guard = self.locks.lock(file_hash).await;

        let mut record = self
            .records
            .find_by_hash(file_hash)?
            .ok_or_else(|| StoreError::Validation(format!("no record for {file_hash}")))?;
        if record.size != size {
            return Err(StoreError::Validation(format!(
                "size {size} does not match record size {}",
                record.size
            )));
        }
        let dest = self.config.file_path(file_hash);

        match record.status {
            FileStatus::Finished => return Ok(100),
            FileStatus::ChunkMerging => {
                if let Some(pct) = self.progress(record.id) {
                    return Ok(pct);
                }
                warn!(file_hash, id = record.id, "merge session lost, discarding destination");
                remove_file_if_exists(&dest).await?;
                record.status = FileStatus::ChunkUploaded;
                self.records.update(&record)?;
                return Err(StoreError::Consistency(
                    "merge session was lost; merge again".into(),
                ));
            }
            FileStatus::ChunkUploaded => {}
            other => {
                return Err(StoreError::Validation(format!(
                    "record {} is {other}, not ready to merge",
                    record.id
                )));
            }
        }

        if let Some(failure) = lock(&self.registry).failures.remove(&record.id) {
            return Err(failure.into());
        }
        if self.is_busy(record.id) {
            return Err(StoreError::Consistency(
                "previous merge is still stopping; retry shortly".into(),
            ));
        }

        let plan = self.config.plan(size)?;
        tokio::fs::create_dir_all(&self.config.files_dir).await?;

        let mut existing = match tokio::fs::metadata(&dest).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if existing == size {
            info!(file_hash, id = record.id, "destination already complete");
            record.status = FileStatus::Finished;
            self.records.update(&record)?;
            self.chunks.remove_dir(file_hash).await?;
            return Ok(100);
        }
        if existing > size {
            warn!(file_hash, existing, size, "destination larger than expected, removing");
            remove_file_if_exists(&dest).await?;
            existing = 0;
        }

        let needed = (size + self.config.safety_margin).saturating_sub(existing);
        let available = self.disk.available(&self.config.files_dir)?;
        if available < needed {
            warn!(file_hash, needed, available, "not enough disk space to merge");
            return Err(StoreError::Capacity { needed, available });
        }

        let indices = self.chunks.scan(file_hash, &plan).await?;
        if indices.len() as u64 != plan.chunk_count() {
            record.status = FileStatus::ChunkUploading;
            self.records.update(&record)?;
            return Err(StoreError::Consistency(format!(
                "{} of {} chunks present",
                indices.len(),
                plan.chunk_count()
            )));
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&dest)
            .await?
            .into_std()
            .await;

        record.status = FileStatus::ChunkMerging;
        self.records.update(&record)?;

        let session = Arc::new(MergeSession {
            session_id: Uuid::new_v4(),
            record_id: record.id,
            file_hash: file_hash.to_string(),
            chunk_count: plan.chunk_count(),
            finished: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            handle: Mutex::new(Some(Arc::new(file))),
        });
        lock(&self.registry)
            .active
            .insert(record.id, session.clone());

        info!(
            file_hash,
            id = record.id,
            chunks = plan.chunk_count(),
            workers = self.config.merge_workers,
            "merge started"
        );
        let _ = self.events.send(MergeEvent::Started {
            id: record.id,
            file_hash: file_hash.to_string(),
            chunk_count: plan.chunk_count(),
        });

        let jobs: VecDeque<(u64, PathBuf)> = indices
            .into_iter()
            .map(|i| (i, self.config.chunk_path(file_hash, i)))
            .collect();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine.scatter(&session, &plan, jobs).await;
            engine.finish_job(&session, &plan, result).await;
        });

        Ok(0)
    }

    /// Cancels the running merge of record `id`.
    ///
    /// The record goes back to `ChunkUploaded` immediately; the workers stop
    /// at their next slice boundary.
    pub async fn cancel_merge(&self, id: u64) -> Result<(), StoreError> {
        let record = self
            .records
            .find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))?;
        let _guard = self.locks.lock(&record.file_hash).await;

        let session = {
            let mut registry = lock(&self.registry);
            let session = registry
                .active
                .remove(&id)
                .ok_or(StoreError::NothingToCancel(id))?;
            registry.draining.insert(id, session.clone());
            session
        };
        session.cancel.cancel();
        session.drop_handle();

        self.set_status(id, FileStatus::ChunkUploaded)?;
        info!(file_hash = %record.file_hash, id, "merge cancelled");
        let _ = self.events.send(MergeEvent::Cancelled {
            id,
            file_hash: record.file_hash,
        });
        Ok(())
    }

    async fn scatter(
        &self,
        session: &Arc<MergeSession>,
        plan: &ChunkPlan,
        jobs: VecDeque<(u64, PathBuf)>,
    ) -> Result<(), MergeFailure> {
        let workers = self.config.merge_workers.clamp(1, jobs.len().max(1));
        let queue = Arc::new(Mutex::new(jobs));
        let abort = session.cancel.child_token();

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(merge_worker(
                session.clone(),
                queue.clone(),
                abort.clone(),
                *plan,
                self.events.clone(),
            ));
        }

        let mut first_failure = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(MergeFailure::Io(e.to_string())));
            if let Err(failure) = outcome {
                abort.cancel();
                first_failure.get_or_insert(failure);
            }
        }

        if session.cancel.is_cancelled() {
            return Err(MergeFailure::Cancelled);
        }
        if let Some(failure) = first_failure {
            return Err(failure);
        }

        let file = session.handle().ok_or(MergeFailure::Cancelled)?;
        let len = tokio::task::spawn_blocking(move || {
            file.sync_all()?;
            file.metadata().map(|m| m.len())
        })
        .await
        .map_err(|e| MergeFailure::Io(e.to_string()))?
        .map_err(classify_io)?;

        if len != plan.file_size() {
            return Err(MergeFailure::SizeMismatch {
                expected: plan.file_size(),
                actual: len,
            });
        }
        Ok(())
    }

    async fn finish_job(
        &self,
        session: &Arc<MergeSession>,
        plan: &ChunkPlan,
        result: Result<(), MergeFailure>,
    ) {
        let _guard = self.locks.lock(&session.file_hash).await;
        let id = session.record_id;
        let file_hash = session.file_hash.clone();

        let current = {
            let mut registry = lock(&self.registry);
            match registry.active.get(&id) {
                Some(s) if s.session_id == session.session_id => {
                    registry.active.remove(&id);
                    true
                }
                _ => {
                    if registry
                        .draining
                        .get(&id)
                        .is_some_and(|s| s.session_id == session.session_id)
                    {
                        registry.draining.remove(&id);
                    }
                    false
                }
            }
        };
        session.drop_handle();

        if !current {
            self.truncate_to_prefix(session, plan).await;
            debug!(%file_hash, id, "cancelled merge drained");
            return;
        }

        match result {
            Ok(()) => {
                if let Err(e) = self.chunks.remove_dir(&file_hash).await {
                    warn!(%file_hash, error = %e, "failed to remove merged chunks");
                }
                if let Err(e) = self.set_status(id, FileStatus::Finished) {
                    error!(%file_hash, id, error = %e, "failed to mark merge finished");
                    return;
                }
                info!(%file_hash, id, "merge finished");
                let _ = self.events.send(MergeEvent::Finished { id, file_hash });
            }
            Err(failure) => {
                self.truncate_to_prefix(session, plan).await;
                if let Err(e) = self.set_status(id, FileStatus::ChunkUploaded) {
                    error!(%file_hash, id, error = %e, "failed to revert merge status");
                }
                error!(%file_hash, id, error = %failure, "merge failed");
                lock(&self.registry).failures.insert(id, failure.clone());
                let _ = self.events.send(MergeEvent::Failed {
                    id,
                    file_hash,
                    failure,
                });
            }
        }
    }

    /// Cuts the destination back to the chunks written without gaps.
    async fn truncate_to_prefix(&self, session: &MergeSession, plan: &ChunkPlan) {
        let prefix = session.finished_prefix();
        let keep = if prefix >= plan.chunk_count() {
            plan.file_size()
        } else {
            plan.offset_of(prefix)
        };
        let dest = self.config.file_path(&session.file_hash);
        let result = async {
            let file = tokio::fs::OpenOptions::new().write(true).open(&dest).await?;
            file.set_len(keep).await
        }
        .await;
        match result {
            Ok(()) => debug!(file_hash = %session.file_hash, keep, "destination truncated"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(file_hash = %session.file_hash, error = %e, "truncate failed, removing destination");
                let _ = remove_file_if_exists(&dest).await;
            }
        }
    }

    fn set_status(&self, id: u64, status: FileStatus) -> Result<(), StoreError> {
        let mut record = self
            .records
            .find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))?;
        record.status = status;
        self.records.update(&record)
    }
}

async fn merge_worker(
    session: Arc<MergeSession>,
    queue: Arc<Mutex<VecDeque<(u64, PathBuf)>>>,
    abort: CancellationToken,
    plan: ChunkPlan,
    events: broadcast::Sender<MergeEvent>,
) -> Result<(), MergeFailure> {
    loop {
        if abort.is_cancelled() {
            return Ok(());
        }
        let Some((index, path)) = lock(&queue).pop_front() else {
            return Ok(());
        };

        let data = Arc::new(tokio::fs::read(&path).await.map_err(classify_io)?);
        let expected = plan.expected_len(index).unwrap_or(0);
        if data.len() as u64 != expected {
            return Err(MergeFailure::Io(format!(
                "chunk {index} has {} bytes, expected {expected}",
                data.len()
            )));
        }

        let base = plan.offset_of(index);
        let mut start = 0;
        while start < data.len() {
            if abort.is_cancelled() {
                return Ok(());
            }
            let Some(file) = session.handle() else {
                return Ok(());
            };
            let end = (start + WRITE_SLICE).min(data.len());
            let buf = data.clone();
            let offset = base + start as u64;
            tokio::task::spawn_blocking(move || write_at(&file, &buf[start..end], offset))
                .await
                .map_err(|e| MergeFailure::Io(e.to_string()))?
                .map_err(classify_io)?;
            start = end;
        }

        let percentage = session.mark_finished(index);
        debug!(file_hash = %session.file_hash, index, percentage, "chunk merged");
        let _ = events.send(MergeEvent::Progress {
            id: session.record_id,
            file_hash: session.file_hash.clone(),
            percentage,
        });
    }
}

#[cfg(unix)]
fn write_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &std::fs::File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(ErrorKind::WriteZero));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// ENOSPC on Unix, ERROR_DISK_FULL on Windows.
fn classify_io(err: std::io::Error) -> MergeFailure {
    let full = err.kind() == ErrorKind::StorageFull || matches!(err.raw_os_error(), Some(28 | 112));
    if full {
        MergeFailure::DiskFull
    } else {
        MergeFailure::Io(err.to_string())
    }
}

async fn remove_file_if_exists(path: &std::path::Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
