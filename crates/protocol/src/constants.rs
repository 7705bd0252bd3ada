use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Size of a full chunk (30 MiB). Every chunk except possibly the last has this length.
pub const CHUNK_SIZE: u64 = 30 * 1024 * 1024;

/// Length of the leading/trailing fingerprint windows.
///
/// Files smaller than the window are fingerprinted over their whole content,
/// so `start_hash == end_hash` for them.
pub const FINGERPRINT_WINDOW: u64 = CHUNK_SIZE;

/// Files above this size try a fingerprint lookup before computing the full hash.
pub const QUICK_LOOKUP_THRESHOLD: u64 = 1024 * 1024;

/// Length of an MD5 digest in lowercase hex.
pub const HASH_HEX_LEN: usize = 32;

/// Maximum filename length accepted by `verify` and `rename`.
pub const MAX_FILENAME_LEN: usize = 64;

/// Extra free space required on top of the file size before merging (100 MiB).
pub const DISK_SAFETY_MARGIN: u64 = 100 * 1024 * 1024;

/// Width of the merge worker pool.
pub const MERGE_WORKERS: usize = 9;

/// Width of the chunk admission pool.
pub const ADMISSION_WORKERS: usize = 8;

/// Maximum number of transfer connections opened for one file.
pub const MAX_TRANSFER_CONNECTIONS: usize = 5;

/// Maximum payload carried by one transfer data frame (1 MiB).
pub const SLICE_SIZE: u64 = 1024 * 1024;

/// Length of the big-endian offset prefix of a transfer data frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Size of the binary slices streamed by the download route.
pub const DOWNLOAD_SLICE_SIZE: usize = 1024 * 1024;

/// Time to wait for a pong response (or any incoming message).
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (a full chunk plus header headroom).
pub const WS_MAX_MESSAGE_SIZE: usize = CHUNK_SIZE as usize + 64 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary request/response operations (chunk uploads).
///
/// A 30 MiB chunk over a slow link plus the exclusive-create write on the
/// server side can take well over the text timeout.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum wait for the next transfer frame while a chunk is in progress.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum wait for the server's answer to a transfer action or frame.
pub const TRANSFER_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket route of the JSON control channel.
pub const CONTROL_PATH: &str = "/ws/control";

/// WebSocket route of the binary transfer channel.
pub const TRANSFER_PATH: &str = "/ws/transfer";

/// WebSocket route of the download stream.
pub const DOWNLOAD_PATH: &str = "/ws/download";

/// Control channel message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "verify")]
    Verify,
    #[serde(rename = "lookup")]
    Lookup,
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "cancel_merge")]
    CancelMerge,
    #[serde(rename = "check")]
    Check,
    #[serde(rename = "rename")]
    Rename,
    #[serde(rename = "detail")]
    Detail,
    #[serde(rename = "list")]
    List,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "set_outside_download")]
    SetOutsideDownload,
    #[serde(rename = "get_config")]
    GetConfig,
    #[serde(rename = "set_config")]
    SetConfig,

    // Responses
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "verify_response")]
    VerifyResponse,
    #[serde(rename = "lookup_response")]
    LookupResponse,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "merge_response")]
    MergeResponse,
    #[serde(rename = "check_response")]
    CheckResponse,
    #[serde(rename = "detail_response")]
    DetailResponse,
    #[serde(rename = "list_response")]
    ListResponse,
    #[serde(rename = "config_response")]
    ConfigResponse,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common control channel error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const WS_ERR_CODE_INSUFFICIENT_STORAGE: i32 = 507;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::CancelMerge).unwrap(),
            "\"cancel_merge\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::VerifyResponse).unwrap(),
            "\"verify_response\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"upload_chunk\"").unwrap();
        assert_eq!(mt, MessageType::UploadChunk);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn window_matches_chunk_size() {
        assert_eq!(FINGERPRINT_WINDOW, CHUNK_SIZE);
        assert!(WS_MAX_MESSAGE_SIZE as u64 > CHUNK_SIZE);
    }
}
