//! Control connection management: read/write pumps, ping/pong, send buffering.

use std::net::SocketAddr;
use std::sync::Arc;

use chunkferry_protocol::binary::parse_chunk_frame;
use chunkferry_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_PING_PERIOD,
    WS_PONG_WAIT,
};
use chunkferry_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Handle for sending messages to a connected uploader.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the channel is full or closed.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Sends a raw binary frame.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Binary(data.into()))
            .map_err(|_| SendError)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn pair(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active control connection.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous replies.
pub struct ControlConnection {
    pub peer_addr: SocketAddr,
    sender: Sender,
    cancel: CancellationToken,
}

impl ControlConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals shutdown to both pumps.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Runs the read and write pumps for a control WebSocket.
///
/// The pumps run as background tokio tasks and stop when the connection is
/// closed or the server cancel token fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ControlConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let conn = ControlConnection {
        peer_addr,
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel;
    tokio::spawn(async move {
        read_pump(ws_stream, sender, handler.clone(), read_cancel.clone()).await;
        read_cancel.cancel();
        handler.on_disconnected().await;
        tracing::info!(%peer_addr, "control connection closed");
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches each request on its own task.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => match ws_msg {
                        WsMessage::Text(text) => dispatch_text(&handler, &sender, &text),
                        WsMessage::Binary(data) => dispatch_binary(&handler, &sender, &data),
                        WsMessage::Pong(_) => {
                            got_pong = true;
                            pong_deadline.reset();
                        }
                        WsMessage::Ping(data) => {
                            let _ = sender.tx.try_send(WsMessage::Pong(data));
                        }
                        WsMessage::Close(_) => {
                            tracing::debug!("received close frame");
                            break;
                        }
                        WsMessage::Frame(_) => {}
                    },
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Parses a JSON envelope and spawns the matching handler method.
fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("invalid message JSON: {e}");
            let _ = sender.send_msg(Message::error(
                "",
                WS_ERR_CODE_BAD_REQUEST,
                format!("invalid message: {e}"),
            ));
            return;
        }
    };

    let handler = Arc::clone(handler);
    let s = sender.clone();
    tokio::spawn(async move {
        match msg.msg_type {
            MessageType::Ping => handler.on_ping(s, msg).await,
            MessageType::Verify => handler.on_verify(s, msg).await,
            MessageType::Lookup => handler.on_lookup(s, msg).await,
            MessageType::Merge => handler.on_merge(s, msg).await,
            MessageType::CancelMerge => handler.on_cancel_merge(s, msg).await,
            MessageType::Check => handler.on_check(s, msg).await,
            MessageType::Rename => handler.on_rename(s, msg).await,
            MessageType::Detail => handler.on_detail(s, msg).await,
            MessageType::List => handler.on_list(s, msg).await,
            MessageType::Delete => handler.on_delete(s, msg).await,
            MessageType::SetOutsideDownload => handler.on_set_outside_download(s, msg).await,
            MessageType::GetConfig => handler.on_get_config(s, msg).await,
            MessageType::SetConfig => handler.on_set_config(s, msg).await,
            MessageType::UploadChunk => {
                let _ = s.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, "upload_chunk must be binary");
            }
            _ => {
                tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
                let _ = s.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
            }
        }
    });
}

/// Parses a binary `upload_chunk` frame and spawns the handler.
fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    let frame = match parse_chunk_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("failed to parse binary frame: {e}");
            let _ = sender.send_msg(Message::error(
                "",
                WS_ERR_CODE_BAD_REQUEST,
                format!("invalid chunk frame: {e}"),
            ));
            return;
        }
    };

    let handler = Arc::clone(handler);
    let s = sender.clone();
    tokio::spawn(async move { handler.on_upload_chunk(s, frame).await });
}
