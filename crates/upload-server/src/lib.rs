//! WebSocket server for chunkferry uploads.
//!
//! One listener serves three routes:
//!
//! - `/ws/control`: JSON request/response envelopes (plus binary
//!   `upload_chunk` frames) dispatched to a [`Handler`];
//!   [`StorageHandler`] backs them with a
//!   [`FileService`](chunkferry_file_store::FileService).
//! - `/ws/transfer?fileHash=..&size=..`: the streamed chunk protocol, one
//!   [`TransferSession`] per connection.
//! - `/ws/download?id=..` or `?filename=..`: streams a merged file.
//!
//! Routing, query validation and authentication happen during the HTTP
//! upgrade, so bad requests never become WebSocket connections.

mod auth;
mod connection;
mod control;
mod download;
mod handler;
mod server;
mod transfer;

pub use auth::{Authenticator, TokenAuthenticator, generate_token, validate_token};
pub use connection::{ControlConnection, SendError, Sender};
pub use control::{ConfigListener, StorageHandler};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};
pub use transfer::{ProtocolError, TransferSession};

/// Send buffer capacity of a control connection.
///
/// A client may keep several chunk uploads in flight on one connection and
/// each produces one response; 2048 leaves comfortable headroom.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] chunkferry_file_store::StoreError),

    #[error("connection rejected: {0}")]
    ConnectionRejected(String),
}
