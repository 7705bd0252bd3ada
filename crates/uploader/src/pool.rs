//! Parallel streamed transfer of one file's missing chunks.
//!
//! A [`TransferPool`] opens up to [`MAX_TRANSFER_CONNECTIONS`] connections
//! to `/ws/transfer`, each pulling chunks from a shared [`ChunkQueue`]. The
//! upload budget is split evenly across live connections and re-split
//! whenever one closes or the budget changes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chunkferry_protocol::constants::{MAX_TRANSFER_CONNECTIONS, SLICE_SIZE};
use chunkferry_protocol::transfer::TransferTarget;
use chunkferry_transfer::{ChunkProgress, ChunkSpan};

use crate::connection::{ConnectionContext, ConnectionReport, TransferConnection};
use crate::queue::ChunkQueue;
use crate::{Endpoint, Pacing, UploadError};

/// Progress reported while a pool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Bytes acknowledged so far, including chunks stored before the run.
    Progress { transferred: u64, percentage: u8 },
    ChunkStored { index: u64 },
    /// The server rejected a completed chunk; it will be sent again.
    ChunkRequeued { index: u64 },
    ConnectionClosed { live: usize },
}

/// Result of a pool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOutcome {
    pub stored_chunks: usize,
    /// Chunks left in the queue when the last connection closed.
    pub remaining: usize,
}

impl PoolOutcome {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Number of connections to open for `remaining` chunks under `budget`.
///
/// A budget allows one connection per started [`SLICE_SIZE`] per second.
pub fn connection_count(budget: u64, remaining: usize, max: usize) -> usize {
    let by_budget = if budget == 0 {
        max
    } else {
        budget.div_ceil(SLICE_SIZE).min(max as u64) as usize
    };
    by_budget.min(remaining)
}

/// Per-connection share of `budget`; 0 stays unlimited.
pub fn split_budget(budget: u64, live: usize) -> u64 {
    if budget == 0 || live == 0 {
        return 0;
    }
    budget.div_ceil(live as u64)
}

fn rebalance(pacers: &[watch::Sender<Pacing>], budget: u64) {
    let pacing = Pacing::for_budget(split_budget(budget, pacers.len()));
    for pacer in pacers {
        pacer.send_replace(pacing);
    }
}

pub struct TransferPool {
    endpoint: Endpoint,
    source: PathBuf,
    target: TransferTarget,
    chunk_size: u64,
    max_connections: usize,
    paused: watch::Sender<bool>,
    budget: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl TransferPool {
    /// `budget` is the total upload rate in bytes per second; 0 is unlimited.
    pub fn new(
        endpoint: Endpoint,
        source: &Path,
        target: TransferTarget,
        chunk_size: u64,
        budget: u64,
    ) -> Self {
        Self {
            endpoint,
            source: source.to_path_buf(),
            target,
            chunk_size,
            max_connections: MAX_TRANSFER_CONNECTIONS,
            paused: watch::Sender::new(false),
            budget: watch::Sender::new(budget),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.clamp(1, MAX_TRANSFER_CONNECTIONS);
        self
    }

    /// Holds every connection before its next slice.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Changes the total budget; live connections pick it up before their
    /// next slice.
    pub fn set_budget(&self, bytes_per_sec: u64) {
        self.budget.send_replace(bytes_per_sec);
    }

    pub fn budget(&self) -> u64 {
        *self.budget.borrow()
    }

    /// Stops all connections. A cancelled pool cannot be run again.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Uploads `pending` and returns once every connection has closed.
    ///
    /// `already_stored` is the byte count of chunks the server had before
    /// this run, so progress starts where the file actually stands. The run
    /// is complete when the queue drained; if it did not and a connection
    /// failed, the first failure is returned.
    pub async fn run(
        &self,
        pending: Vec<ChunkSpan>,
        already_stored: u64,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<PoolOutcome, UploadError> {
        let queue = ChunkQueue::new(pending);
        if queue.is_empty() {
            return Ok(PoolOutcome {
                stored_chunks: 0,
                remaining: 0,
            });
        }
        let progress = Arc::new(Mutex::new(ChunkProgress::new(
            self.target.size,
            already_stored,
        )));

        let mut budget_rx = self.budget.subscribe();
        let budget = *budget_rx.borrow_and_update();
        let count = connection_count(budget, queue.len(), self.max_connections);
        let share = split_budget(budget, count);
        info!(
            file_hash = %self.target.file_hash,
            chunks = queue.len(),
            connections = count,
            budget,
            "starting transfer"
        );

        let mut set = JoinSet::new();
        let mut pacers = Vec::with_capacity(count);
        for id in 0..count {
            let (pacer, pacing) = watch::channel(Pacing::for_budget(share));
            pacers.push(pacer);
            let ctx = ConnectionContext {
                queue: queue.clone(),
                pacing,
                paused: self.paused.subscribe(),
                progress: Arc::clone(&progress),
                events: events.clone(),
                cancel: self.cancel.clone(),
            };
            set.spawn(run_connection(
                id,
                self.endpoint.clone(),
                self.target.clone(),
                self.source.clone(),
                self.chunk_size,
                ctx,
            ));
        }

        let mut stored_chunks = 0;
        let mut first_error = None;
        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(Ok(report)) => stored_chunks += report.chunks,
                        Ok(Err(UploadError::Cancelled)) => {}
                        Ok(Err(e)) => {
                            warn!(file_hash = %self.target.file_hash, error = %e, "transfer connection failed");
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                        Err(e) => error!("transfer connection task failed: {e}"),
                    }
                    pacers.retain(|pacer| !pacer.is_closed());
                    rebalance(&pacers, *budget_rx.borrow());
                    let _ = events.send(TransferEvent::ConnectionClosed { live: pacers.len() }).await;
                }
                Ok(()) = budget_rx.changed() => {
                    let budget = *budget_rx.borrow_and_update();
                    info!(budget, live = pacers.len(), "upload budget changed");
                    rebalance(&pacers, budget);
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let remaining = queue.len();
        let outcome = PoolOutcome {
            stored_chunks,
            remaining,
        };
        if outcome.is_complete() {
            info!(file_hash = %self.target.file_hash, chunks = stored_chunks, "transfer finished");
            return Ok(outcome);
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                warn!(file_hash = %self.target.file_hash, remaining, "transfer ended with chunks left");
                Ok(outcome)
            }
        }
    }
}

async fn run_connection(
    id: usize,
    endpoint: Endpoint,
    target: TransferTarget,
    source: PathBuf,
    chunk_size: u64,
    ctx: ConnectionContext,
) -> Result<ConnectionReport, UploadError> {
    let conn = TransferConnection::connect(id, &endpoint, &target, &source, chunk_size).await?;
    conn.run(ctx).await
}
