//! Streamed chunk transfer: one [`TransferSession`] per `/ws/transfer` connection.
//!
//! The session is a plain state machine driven by [`serve_transfer`]. It owns
//! at most one open [`ChunkSink`]; data frames must arrive in order, and each
//! one is acknowledged before the client sends the next.

use std::sync::Arc;
use std::time::Duration;

use chunkferry_file_store::{Admission, ChunkSink, ChunkStore, StoreError};
use chunkferry_protocol::transfer::{
    CODE_BAD_REQUEST, CODE_CHUNK_IN_PROGRESS, CODE_CHUNK_MISSING, CODE_CHUNK_OVERFLOW,
    CODE_CHUNK_SIZE_MISMATCH, CODE_INTERNAL, CODE_NO_CHUNK_CONFIGURED, CODE_NOT_AUTHENTICATED,
    CODE_OFFSET_MISMATCH, CODE_TIMEOUT, CODE_UNSUPPORTED_FRAME, TransferAction, TransferReply,
    TransferTarget, close_code_for, parse_data_frame,
};
use chunkferry_transfer::ChunkPlan;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ServerError;

/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// A rejected action or frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transfer error {code}: {message}")]
pub struct ProtocolError {
    pub code: u32,
    pub message: String,
    /// Fatal errors end the connection after the error reply.
    pub fatal: bool,
}

impl ProtocolError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        let fatal = matches!(
            code,
            CODE_OFFSET_MISMATCH
                | CODE_CHUNK_OVERFLOW
                | CODE_NOT_AUTHENTICATED
                | CODE_TIMEOUT
                | CODE_INTERNAL
        );
        Self {
            code,
            message: message.into(),
            fatal,
        }
    }

    pub fn close_code(&self) -> u16 {
        close_code_for(self.code)
    }

    pub fn reply(&self) -> TransferReply {
        TransferReply::Error {
            code: self.code,
            message: self.message.clone(),
        }
    }
}

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => Self::new(CODE_BAD_REQUEST, msg),
            other => Self::new(CODE_INTERNAL, other.to_string()),
        }
    }
}

#[derive(Debug)]
enum State {
    Connecting,
    Ready,
    Receiving(ChunkSink),
    /// The last chunk was committed and awaits confirmation by `reset`.
    Completed {
        index: u64,
        expected: u64,
        merged: bool,
    },
}

/// Server side of one transfer connection.
#[derive(Debug)]
pub struct TransferSession {
    chunks: Arc<ChunkStore>,
    target: TransferTarget,
    plan: ChunkPlan,
    state: State,
}

impl TransferSession {
    /// Fails when the target hash or size is invalid.
    pub fn new(chunks: Arc<ChunkStore>, target: TransferTarget) -> Result<Self, StoreError> {
        chunkferry_transfer::validate_file_hash(&target.file_hash)?;
        let plan = chunks.config().plan(target.size)?;
        Ok(Self {
            chunks,
            target,
            plan,
            state: State::Connecting,
        })
    }

    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    /// Unlocks the session. The chunk directory is created by the first
    /// configured chunk, unless the file is already merged.
    pub async fn handshake(&mut self) -> Result<TransferReply, ProtocolError> {
        self.state = State::Ready;
        Ok(TransferReply::Ready)
    }

    /// `true` while a chunk is open and only partially received.
    pub fn in_progress(&self) -> bool {
        matches!(self.state, State::Receiving(_))
    }

    /// Handles a text frame carrying a [`TransferAction`].
    pub async fn on_text(&mut self, text: &str) -> Result<TransferReply, ProtocolError> {
        let action: TransferAction = serde_json::from_str(text)
            .map_err(|e| ProtocolError::new(CODE_BAD_REQUEST, format!("invalid action: {e}")))?;
        match action {
            TransferAction::ChunkConfig { index, size } => self.configure(index, size).await,
            TransferAction::Reset => self.reset().await,
        }
    }

    async fn configure(&mut self, index: u64, size: u64) -> Result<TransferReply, ProtocolError> {
        match &self.state {
            State::Connecting => return Err(not_authenticated()),
            State::Receiving(sink) => {
                return Err(ProtocolError::new(
                    CODE_CHUNK_IN_PROGRESS,
                    format!("chunk {} is still being received", sink.index()),
                ));
            }
            State::Ready | State::Completed { .. } => {}
        }

        let expected = self
            .plan
            .span(index)
            .map_err(|e| ProtocolError::new(CODE_BAD_REQUEST, e.to_string()))?
            .len;
        if size != expected {
            return Err(ProtocolError::new(
                CODE_BAD_REQUEST,
                format!("chunk {index} is {expected} bytes, not {size}"),
            ));
        }

        let sink = self
            .chunks
            .open_streamed(&self.target.file_hash, self.target.size, index)
            .await?;
        debug!(file_hash = %self.target.file_hash, index, size, "chunk configured");
        self.state = State::Receiving(sink);
        Ok(TransferReply::ChunkReady { index })
    }

    async fn reset(&mut self) -> Result<TransferReply, ProtocolError> {
        match std::mem::replace(&mut self.state, State::Ready) {
            State::Connecting => {
                self.state = State::Connecting;
                Err(not_authenticated())
            }
            State::Ready => Ok(TransferReply::Ready),
            State::Receiving(sink) => {
                let (index, written, expected) = (sink.index(), sink.written(), sink.expected_len());
                sink.discard().await?;
                Err(ProtocolError::new(
                    CODE_CHUNK_SIZE_MISMATCH,
                    format!("chunk {index} reset at {written} of {expected} bytes"),
                ))
            }
            State::Completed { merged: true, .. } => Ok(TransferReply::Ready),
            State::Completed {
                index, expected, ..
            } => {
                match self.chunks.stat_chunk(&self.target.file_hash, index).await? {
                    None => Err(ProtocolError::new(
                        CODE_CHUNK_MISSING,
                        format!("chunk {index} is missing"),
                    )),
                    Some(len) if len != expected => Err(ProtocolError::new(
                        CODE_CHUNK_SIZE_MISMATCH,
                        format!("chunk {index} is {len} bytes, expected {expected}"),
                    )),
                    Some(_) => Ok(TransferReply::Ready),
                }
            }
        }
    }

    /// Handles a binary data frame `[u64 BE offset][payload]`.
    pub async fn on_binary(&mut self, data: &[u8]) -> Result<TransferReply, ProtocolError> {
        let sink = match &mut self.state {
            State::Connecting => return Err(not_authenticated()),
            State::Receiving(sink) => sink,
            State::Ready | State::Completed { .. } => {
                return Err(ProtocolError::new(
                    CODE_NO_CHUNK_CONFIGURED,
                    "no chunk configured",
                ));
            }
        };
        let (offset, payload) = parse_data_frame(data)
            .ok_or_else(|| ProtocolError::new(CODE_BAD_REQUEST, "data frame shorter than its header"))?;

        if offset != sink.written() {
            return Err(ProtocolError::new(
                CODE_OFFSET_MISMATCH,
                format!("offset {offset}, expected {}", sink.written()),
            ));
        }
        if sink.written() + payload.len() as u64 > sink.expected_len() {
            return Err(ProtocolError::new(
                CODE_CHUNK_OVERFLOW,
                format!(
                    "{} bytes at offset {offset} overflow chunk {} of {} bytes",
                    payload.len(),
                    sink.index(),
                    sink.expected_len()
                ),
            ));
        }

        let written = sink.append(payload).await?;
        if !sink.is_complete() {
            return Ok(TransferReply::Continue {
                offset: written,
                received: payload.len() as u64,
            });
        }

        let State::Receiving(sink) = std::mem::replace(&mut self.state, State::Ready) else {
            return Err(ProtocolError::new(CODE_INTERNAL, "chunk sink vanished"));
        };
        let (index, expected) = (sink.index(), sink.expected_len());
        let admission = sink.commit().await?;
        debug!(file_hash = %self.target.file_hash, index, ?admission, "streamed chunk complete");
        self.state = State::Completed {
            index,
            expected,
            merged: admission == Admission::AlreadyMerged,
        };
        Ok(TransferReply::ChunkComplete { index })
    }

    /// Drops any partially received chunk.
    pub async fn abort(&mut self) {
        if let State::Receiving(sink) = std::mem::replace(&mut self.state, State::Ready) {
            let index = sink.index();
            if let Err(e) = sink.discard().await {
                warn!(file_hash = %self.target.file_hash, index, error = %e, "failed to discard partial chunk");
            }
        }
    }
}

fn not_authenticated() -> ProtocolError {
    ProtocolError::new(CODE_NOT_AUTHENTICATED, "handshake not completed")
}

/// Builds a close frame, trimming the reason to the control-frame limit.
pub(crate) fn close_message(code: u16, reason: &str) -> WsMessage {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason[..end].to_string().into(),
    }))
}

enum Event {
    Frame(Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>),
    IdleTimeout,
    Shutdown,
}

/// Drives `session` over `ws` until the peer leaves, a fatal error occurs,
/// or `cancel` fires.
pub(crate) async fn serve_transfer<S>(
    ws: S,
    mut session: TransferSession,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), ServerError>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let result = drive(&mut session, &mut sink, &mut stream, idle_timeout, &cancel).await;
    session.abort().await;
    info!(file_hash = %session.target().file_hash, "transfer connection closed");
    result
}

async fn drive<K, R>(
    session: &mut TransferSession,
    sink: &mut K,
    stream: &mut R,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), ServerError>
where
    K: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let outcome = session.handshake().await;
    if !send_outcome(sink, outcome).await? {
        return Ok(());
    }

    loop {
        let in_progress = session.in_progress();
        let event = tokio::select! {
            _ = cancel.cancelled() => Event::Shutdown,
            frame = stream.next() => Event::Frame(frame),
            _ = tokio::time::sleep(idle_timeout), if in_progress => Event::IdleTimeout,
        };

        let outcome = match event {
            Event::Shutdown => {
                sink.send(close_message(1001, "server shutting down")).await?;
                return Ok(());
            }
            Event::IdleTimeout => {
                warn!(file_hash = %session.target().file_hash, "transfer idle timeout");
                Err(ProtocolError::new(
                    CODE_TIMEOUT,
                    format!("no data for {}s", idle_timeout.as_secs()),
                ))
            }
            Event::Frame(None) => return Ok(()),
            Event::Frame(Some(Err(e))) => {
                debug!("transfer read error: {e}");
                return Ok(());
            }
            Event::Frame(Some(Ok(msg))) => match msg {
                WsMessage::Text(text) => session.on_text(&text).await,
                WsMessage::Binary(data) => session.on_binary(&data).await,
                WsMessage::Ping(data) => {
                    sink.send(WsMessage::Pong(data)).await?;
                    continue;
                }
                WsMessage::Pong(_) => continue,
                WsMessage::Close(_) => return Ok(()),
                WsMessage::Frame(_) => Err(ProtocolError::new(
                    CODE_UNSUPPORTED_FRAME,
                    "unsupported frame type",
                )),
            },
        };
        if !send_outcome(sink, outcome).await? {
            return Ok(());
        }
    }
}

/// Sends the reply for `outcome`; returns `false` when the connection must end.
async fn send_outcome<K>(
    sink: &mut K,
    outcome: Result<TransferReply, ProtocolError>,
) -> Result<bool, ServerError>
where
    K: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match outcome {
        Ok(reply) => {
            sink.send(WsMessage::Text(serde_json::to_string(&reply)?.into()))
                .await?;
            Ok(true)
        }
        Err(err) => {
            if err.fatal {
                warn!(code = err.code, "fatal transfer error: {}", err.message);
            } else {
                debug!(code = err.code, "transfer error: {}", err.message);
            }
            sink.send(WsMessage::Text(serde_json::to_string(&err.reply())?.into()))
                .await?;
            if err.fatal {
                sink.send(close_message(err.close_code(), &err.message)).await?;
                return Ok(false);
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use chunkferry_file_store::StoreConfig;
    use chunkferry_protocol::transfer::encode_data_frame;

    use super::*;

    const HASH: &str = "00112233445566778899aabbccddeeff";

    fn session(dir: &tempfile::TempDir) -> (Arc<StoreConfig>, TransferSession) {
        let mut cfg = StoreConfig::new(dir.path());
        cfg.chunk_size = 10;
        let config = Arc::new(cfg);
        let chunks = Arc::new(ChunkStore::new(config.clone()));
        let target = TransferTarget {
            file_hash: HASH.into(),
            size: 25,
        };
        (config, TransferSession::new(chunks, target).unwrap())
    }

    fn config_action(index: u64, size: u64) -> String {
        serde_json::to_string(&TransferAction::ChunkConfig { index, size }).unwrap()
    }

    fn part_files(config: &StoreConfig) -> usize {
        std::fs::read_dir(config.chunk_dir(HASH))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(".part-")
            })
            .count()
    }

    #[test]
    fn fatal_codes() {
        assert!(ProtocolError::new(CODE_OFFSET_MISMATCH, "").fatal);
        assert!(ProtocolError::new(CODE_TIMEOUT, "").fatal);
        assert!(!ProtocolError::new(CODE_CHUNK_SIZE_MISMATCH, "").fatal);
        assert!(!ProtocolError::new(CODE_CHUNK_IN_PROGRESS, "").fatal);
        assert_eq!(ProtocolError::new(CODE_OFFSET_MISMATCH, "").close_code(), 4004);
    }

    #[test]
    fn invalid_target_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks = Arc::new(ChunkStore::new(Arc::new(StoreConfig::new(dir.path()))));
        let bad_hash = TransferTarget {
            file_hash: "nothex".into(),
            size: 1,
        };
        assert!(TransferSession::new(chunks.clone(), bad_hash).is_err());
        let zero = TransferTarget {
            file_hash: HASH.into(),
            size: 0,
        };
        assert!(TransferSession::new(chunks, zero).is_err());
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let WsMessage::Close(Some(frame)) = close_message(4004, &reason) else {
            panic!("expected close frame");
        };
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(u16::from(frame.code), 4004);
    }

    #[tokio::test]
    async fn streams_a_chunk_in_slices() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, mut s) = session(&dir);

        assert_eq!(s.handshake().await.unwrap(), TransferReply::Ready);

        let reply = s.on_text(&config_action(2, 5)).await.unwrap();
        assert_eq!(reply, TransferReply::ChunkReady { index: 2 });
        assert!(s.in_progress());

        let reply = s.on_binary(&encode_data_frame(0, b"abc")).await.unwrap();
        assert_eq!(
            reply,
            TransferReply::Continue {
                offset: 3,
                received: 3
            }
        );
        let reply = s.on_binary(&encode_data_frame(3, b"de")).await.unwrap();
        assert_eq!(reply, TransferReply::ChunkComplete { index: 2 });
        assert!(!s.in_progress());
        assert_eq!(std::fs::read(config.chunk_path(HASH, 2)).unwrap(), b"abcde");

        let reply = s.on_text(r#"{"action":"reset"}"#).await.unwrap();
        assert_eq!(reply, TransferReply::Ready);
    }

    #[tokio::test]
    async fn offset_desync_is_fatal_and_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, mut s) = session(&dir);
        s.handshake().await.unwrap();
        s.on_text(&config_action(0, 10)).await.unwrap();
        s.on_binary(&encode_data_frame(0, b"0123")).await.unwrap();

        let err = s.on_binary(&encode_data_frame(6, b"xx")).await.unwrap_err();
        assert_eq!(err.code, CODE_OFFSET_MISMATCH);
        assert!(err.fatal);

        s.abort().await;
        assert_eq!(part_files(&config), 0);
        assert!(!config.chunk_path(HASH, 0).exists());
    }

    #[tokio::test]
    async fn overflow_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_config, mut s) = session(&dir);
        s.handshake().await.unwrap();
        s.on_text(&config_action(2, 5)).await.unwrap();

        let err = s.on_binary(&encode_data_frame(0, b"abcdef")).await.unwrap_err();
        assert_eq!(err.code, CODE_CHUNK_OVERFLOW);
        assert!(err.fatal);
    }

    #[tokio::test]
    async fn ordering_errors_are_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_config, mut s) = session(&dir);

        let err = s.on_binary(&encode_data_frame(0, b"a")).await.unwrap_err();
        assert_eq!(err.code, CODE_NOT_AUTHENTICATED);

        s.handshake().await.unwrap();
        let err = s.on_binary(&encode_data_frame(0, b"a")).await.unwrap_err();
        assert_eq!(err.code, CODE_NO_CHUNK_CONFIGURED);
        assert!(!err.fatal);

        let err = s.on_text("not json").await.unwrap_err();
        assert_eq!(err.code, CODE_BAD_REQUEST);

        let err = s.on_text(&config_action(2, 10)).await.unwrap_err();
        assert_eq!(err.code, CODE_BAD_REQUEST);
        let err = s.on_text(&config_action(3, 5)).await.unwrap_err();
        assert_eq!(err.code, CODE_BAD_REQUEST);

        s.on_text(&config_action(0, 10)).await.unwrap();
        let err = s.on_text(&config_action(1, 10)).await.unwrap_err();
        assert_eq!(err.code, CODE_CHUNK_IN_PROGRESS);
        assert!(!err.fatal);
    }

    #[tokio::test]
    async fn reset_reports_missing_or_resized_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, mut s) = session(&dir);
        s.handshake().await.unwrap();

        s.on_text(&config_action(2, 5)).await.unwrap();
        s.on_binary(&encode_data_frame(0, b"abcde")).await.unwrap();
        std::fs::write(config.chunk_path(HASH, 2), b"abc").unwrap();
        let err = s.on_text(r#"{"action":"reset"}"#).await.unwrap_err();
        assert_eq!(err.code, CODE_CHUNK_SIZE_MISMATCH);
        assert!(!err.fatal);

        s.on_text(&config_action(2, 5)).await.unwrap();
        s.on_binary(&encode_data_frame(0, b"abcde")).await.unwrap();
        std::fs::remove_file(config.chunk_path(HASH, 2)).unwrap();
        let err = s.on_text(r#"{"action":"reset"}"#).await.unwrap_err();
        assert_eq!(err.code, CODE_CHUNK_MISSING);

        // State is cleared either way.
        assert_eq!(
            s.on_text(r#"{"action":"reset"}"#).await.unwrap(),
            TransferReply::Ready
        );
    }

    #[tokio::test]
    async fn reset_mid_chunk_discards_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, mut s) = session(&dir);
        s.handshake().await.unwrap();
        s.on_text(&config_action(0, 10)).await.unwrap();
        s.on_binary(&encode_data_frame(0, b"0123")).await.unwrap();

        let err = s.on_text(r#"{"action":"reset"}"#).await.unwrap_err();
        assert_eq!(err.code, CODE_CHUNK_SIZE_MISMATCH);
        assert!(!s.in_progress());
        assert_eq!(part_files(&config), 0);

        // The chunk can be configured again from scratch.
        s.on_text(&config_action(0, 10)).await.unwrap();
        s.on_binary(&encode_data_frame(0, b"0123456789")).await.unwrap();
        assert_eq!(
            std::fs::read(config.chunk_path(HASH, 0)).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn late_chunk_for_merged_file_leaves_no_chunk_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, mut s) = session(&dir);
        std::fs::create_dir_all(&config.files_dir).unwrap();
        std::fs::write(config.file_path(HASH), vec![7u8; 25]).unwrap();

        s.handshake().await.unwrap();
        s.on_text(&config_action(0, 10)).await.unwrap();
        let reply = s.on_binary(&encode_data_frame(0, b"0123456789")).await.unwrap();
        assert_eq!(reply, TransferReply::ChunkComplete { index: 0 });
        assert_eq!(
            s.on_text(r#"{"action":"reset"}"#).await.unwrap(),
            TransferReply::Ready
        );
        assert!(!config.chunk_dir(HASH).exists());
    }
}
