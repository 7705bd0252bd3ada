//! Binary transfer channel: JSON actions/replies plus offset-prefixed data frames.
//!
//! A client declares the chunk it is about to stream with a `chunkConfig`
//! action, then sends data frames of the form
//! `[8 bytes: offset within the chunk (big-endian)][payload]`. Each frame is
//! answered before the next one is sent, so the window is exactly one
//! acknowledgement round-trip.

use serde::{Deserialize, Serialize};

use crate::constants::FRAME_HEADER_LEN;
use crate::query::query_pairs;

/// Malformed action or frame.
pub const CODE_BAD_REQUEST: u32 = 40000;
/// Frame or action received before the handshake completed.
pub const CODE_NOT_AUTHENTICATED: u32 = 10003;
/// Unexpected server-side I/O failure.
pub const CODE_INTERNAL: u32 = 50000;
/// `chunkConfig` received while another chunk is still being streamed.
pub const CODE_CHUNK_IN_PROGRESS: u32 = 50001;
/// Data frame received without a configured chunk.
pub const CODE_NO_CHUNK_CONFIGURED: u32 = 50002;
/// Data frame offset differs from the server's running offset.
pub const CODE_OFFSET_MISMATCH: u32 = 50004;
/// `reset` found a chunk whose size differs from the declared size.
pub const CODE_CHUNK_SIZE_MISMATCH: u32 = 50005;
/// `reset` found no chunk on disk.
pub const CODE_CHUNK_MISSING: u32 = 50006;
/// Frame type other than text or binary data.
pub const CODE_UNSUPPORTED_FRAME: u32 = 50007;
/// Payload would grow the chunk past its declared size.
pub const CODE_CHUNK_OVERFLOW: u32 = 50008;
/// No frame arrived within the idle window while a chunk was in progress.
pub const CODE_TIMEOUT: u32 = 50009;

/// Maps a transfer error code onto a WebSocket close code (4000-4999 range).
pub fn close_code_for(code: u32) -> u16 {
    match code {
        CODE_BAD_REQUEST => 4400,
        CODE_NOT_AUTHENTICATED => 4401,
        c if (50000..51000).contains(&c) => 4000 + (c % 1000) as u16,
        _ => 4000,
    }
}

/// Client to server text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum TransferAction {
    /// Declares the next chunk the client is about to stream.
    ChunkConfig { index: u64, size: u64 },
    /// Confirms the last chunk on disk and returns the session to ready.
    Reset,
}

/// Server to client text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferReply {
    /// Handshake done, or the previous chunk was confirmed by `reset`.
    Ready,
    /// The declared chunk is open; stream from offset 0.
    ChunkReady { index: u64 },
    /// Frame stored; send the slice starting at `offset`.
    Continue { offset: u64, received: u64 },
    /// The chunk reached its declared size and is stored.
    ChunkComplete { index: u64 },
    /// The request failed; fatal errors are followed by a close frame.
    Error { code: u32, message: String },
}

/// Query parameters of the transfer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub file_hash: String,
    pub size: u64,
}

impl TransferTarget {
    /// Renders `fileHash=...&size=...`.
    pub fn to_query(&self) -> String {
        format!("fileHash={}&size={}", self.file_hash, self.size)
    }

    /// Parses the query string of a transfer request.
    pub fn from_query(query: &str) -> Option<Self> {
        let mut file_hash = None;
        let mut size = None;
        for (key, value) in query_pairs(query) {
            match key {
                "fileHash" => file_hash = Some(value.to_string()),
                "size" => size = value.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            file_hash: file_hash?,
            size: size?,
        })
    }
}

/// Encodes a data frame.
pub fn encode_data_frame(offset: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Splits a data frame into its offset and payload.
pub fn parse_data_frame(data: &[u8]) -> Option<(u64, &[u8])> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    let (head, payload) = data.split_at(FRAME_HEADER_LEN);
    let mut offset = [0u8; FRAME_HEADER_LEN];
    offset.copy_from_slice(head);
    Some((u64::from_be_bytes(offset), payload))
}
