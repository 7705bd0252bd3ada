//! One `/ws/transfer` connection streaming chunks from the shared queue.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chunkferry_protocol::constants::{TRANSFER_PATH, TRANSFER_REPLY_TIMEOUT};
use chunkferry_protocol::transfer::{
    CODE_CHUNK_MISSING, CODE_CHUNK_SIZE_MISMATCH, TransferAction, TransferReply, TransferTarget,
    encode_data_frame,
};
use chunkferry_transfer::{ChunkProgress, ChunkReader, ChunkSpan};

use crate::endpoint::ws_config;
use crate::pool::TransferEvent;
use crate::queue::ChunkQueue;
use crate::{Endpoint, Pacing, UploadError};

type TransferSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping interval while paused; well under any server idle timeout.
const PAUSE_KEEPALIVE: Duration = Duration::from_secs(1);

/// State a connection shares with its pool.
pub(crate) struct ConnectionContext {
    pub queue: ChunkQueue,
    pub pacing: watch::Receiver<Pacing>,
    pub paused: watch::Receiver<bool>,
    pub progress: Arc<Mutex<ChunkProgress>>,
    pub events: mpsc::Sender<TransferEvent>,
    pub cancel: CancellationToken,
}

impl ConnectionContext {
    fn record(&self, index: u64, bytes: u64) {
        let (transferred, percentage) = {
            let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            progress.set(index, bytes);
            (progress.transferred(), progress.percentage())
        };
        // Progress is superseded by the next update; never stall on it.
        if self
            .events
            .try_send(TransferEvent::Progress {
                transferred,
                percentage,
            })
            .is_err()
        {
            trace!(index, "progress event dropped");
        }
    }

    fn forget(&self, index: u64) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset(index);
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event).await;
    }
}

/// What a connection achieved before it closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionReport {
    pub chunks: usize,
    pub bytes: u64,
}

enum ChunkOutcome {
    Stored,
    /// The server found the chunk damaged after completion.
    Requeue,
}

pub(crate) struct TransferConnection {
    id: usize,
    ws: TransferSocket,
    reader: ChunkReader,
}

impl TransferConnection {
    /// Opens the socket and waits for the server's `ready`.
    pub(crate) async fn connect(
        id: usize,
        endpoint: &Endpoint,
        target: &TransferTarget,
        source: &Path,
        chunk_size: u64,
    ) -> Result<Self, UploadError> {
        let reader = ChunkReader::open(source, chunk_size).await?;
        let request = endpoint.request(TRANSFER_PATH, Some(&target.to_query()))?;
        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config()), false)
                .await?;
        let mut conn = Self { id, ws, reader };
        match conn.recv_reply().await? {
            TransferReply::Ready => {
                debug!(connection = id, file_hash = %target.file_hash, "transfer connection ready");
                Ok(conn)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Streams chunks until the queue is empty, the server asks for a
    /// requeue, or an error occurs. A chunk that was not stored always goes
    /// back to the queue.
    pub(crate) async fn run(
        mut self,
        mut ctx: ConnectionContext,
    ) -> Result<ConnectionReport, UploadError> {
        let mut report = ConnectionReport::default();
        let result = loop {
            if ctx.cancel.is_cancelled() {
                break Err(UploadError::Cancelled);
            }
            let Some(claim) = ctx.queue.claim() else {
                break Ok(());
            };
            let span = claim.span();

            match self.send_chunk(span, &mut ctx).await {
                Ok(ChunkOutcome::Stored) => {
                    claim.complete();
                    report.chunks += 1;
                    report.bytes += span.len;
                    ctx.emit(TransferEvent::ChunkStored { index: span.index })
                        .await;
                }
                Ok(ChunkOutcome::Requeue) => {
                    ctx.forget(span.index);
                    drop(claim);
                    warn!(connection = self.id, index = span.index, "chunk rejected after upload, requeued");
                    ctx.emit(TransferEvent::ChunkRequeued { index: span.index })
                        .await;
                    break Ok(());
                }
                Err(e) => {
                    ctx.forget(span.index);
                    drop(claim);
                    break Err(e);
                }
            }
        };

        let _ = self.ws.close(None).await;
        debug!(connection = self.id, chunks = report.chunks, "transfer connection closed");
        result.map(|()| report)
    }

    async fn send_chunk(
        &mut self,
        span: ChunkSpan,
        ctx: &mut ConnectionContext,
    ) -> Result<ChunkOutcome, UploadError> {
        self.hold_while_paused(ctx).await?;
        self.send_action(&TransferAction::ChunkConfig {
            index: span.index,
            size: span.len,
        })
        .await?;
        match self.recv_reply().await? {
            TransferReply::ChunkReady { index } if index == span.index => {}
            other => return Err(unexpected(&other)),
        }

        let mut offset = 0u64;
        let mut last_send: Option<Instant> = None;
        loop {
            if offset >= span.len {
                return Err(UploadError::UnexpectedResponse(format!(
                    "continue past the end of chunk {}",
                    span.index
                )));
            }
            self.hold_while_paused(ctx).await?;

            let pacing = *ctx.pacing.borrow();
            if let Some(last) = last_send {
                let delay = pacing.delay(last.elapsed());
                if !delay.is_zero() {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            let len = pacing.slice.min(span.len - offset);
            let data = self
                .reader
                .read_at(span.offset + offset, len as usize)
                .await?;
            self.ws
                .send(WsMessage::Binary(encode_data_frame(offset, &data).into()))
                .await?;
            last_send = Some(Instant::now());

            match self.recv_reply().await? {
                TransferReply::Continue { offset: next, .. } if next > offset => {
                    offset = next;
                    ctx.record(span.index, offset);
                }
                TransferReply::ChunkComplete { index } if index == span.index => {
                    ctx.record(span.index, span.len);
                    break;
                }
                other => return Err(unexpected(&other)),
            }
        }

        self.send_action(&TransferAction::Reset).await?;
        match self.recv_reply().await {
            Ok(TransferReply::Ready) => Ok(ChunkOutcome::Stored),
            Ok(other) => Err(unexpected(&other)),
            Err(UploadError::Protocol { code, .. })
                if code == CODE_CHUNK_SIZE_MISMATCH || code == CODE_CHUNK_MISSING =>
            {
                Ok(ChunkOutcome::Requeue)
            }
            Err(e) => Err(e),
        }
    }

    /// Parks until the pool resumes, pinging so the server's idle timer
    /// never fires mid-chunk.
    async fn hold_while_paused(&mut self, ctx: &mut ConnectionContext) -> Result<(), UploadError> {
        if !*ctx.paused.borrow() {
            return Ok(());
        }
        debug!(connection = self.id, "paused");
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + PAUSE_KEEPALIVE, PAUSE_KEEPALIVE);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = async { ctx.paused.wait_for(|paused| !*paused).await.map(|_| ()) } => break,
                _ = keepalive.tick() => {
                    trace!(connection = self.id, "keepalive ping");
                    self.ws.send(WsMessage::Ping(Default::default())).await?;
                }
            }
        }
        debug!(connection = self.id, "resumed");
        Ok(())
    }

    async fn send_action(&mut self, action: &TransferAction) -> Result<(), UploadError> {
        let json = serde_json::to_string(action)?;
        self.ws.send(WsMessage::Text(json.into())).await?;
        Ok(())
    }

    /// Next reply from the server; error replies become
    /// [`UploadError::Protocol`].
    async fn recv_reply(&mut self) -> Result<TransferReply, UploadError> {
        let reply = tokio::time::timeout(TRANSFER_REPLY_TIMEOUT, read_reply(&mut self.ws))
            .await
            .map_err(|_| UploadError::Timeout)??;
        match reply {
            TransferReply::Error { code, message } => Err(UploadError::Protocol { code, message }),
            reply => Ok(reply),
        }
    }
}

async fn read_reply(ws: &mut TransferSocket) -> Result<TransferReply, UploadError> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return serde_json::from_str(&text).map_err(UploadError::from);
            }
            Some(Ok(WsMessage::Close(frame))) => return Err(closed(frame)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(UploadError::Closed),
        }
    }
}

fn closed(frame: Option<CloseFrame>) -> UploadError {
    match frame {
        Some(frame) if u16::from(frame.code) >= 4000 => UploadError::Protocol {
            code: u16::from(frame.code) as u32,
            message: frame.reason.as_str().to_string(),
        },
        _ => UploadError::Closed,
    }
}

fn unexpected(reply: &TransferReply) -> UploadError {
    UploadError::UnexpectedResponse(format!("{reply:?}"))
}
