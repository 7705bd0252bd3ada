//! Upload error types.

use tokio_tungstenite::tungstenite;

/// Errors produced by the uploader.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] chunkferry_transfer::TransferError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// Error envelope returned by the control channel.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    /// Error reply or close frame on the transfer channel.
    #[error("transfer protocol error {code}: {message}")]
    Protocol { code: u32, message: String },

    #[error("unexpected {0} response")]
    UnexpectedResponse(String),

    #[error("another transfer is already running")]
    TransferBusy,

    #[error("file {id} is stored as {origin_filename}")]
    RenameConflict { id: u64, origin_filename: String },

    #[error("{remaining} chunks still missing after transfer")]
    Incomplete { remaining: usize },

    #[error("download ended after {received} of {expected} bytes")]
    ShortDownload { expected: u64, received: u64 },

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    /// Control channel error code, if the server answered with one.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}
