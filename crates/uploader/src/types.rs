//! Options, events and results of an upload.

use std::time::Duration;

use chunkferry_protocol::constants::{CHUNK_SIZE, FINGERPRINT_WINDOW};

/// Default limit for computing a full-file hash.
pub const HASH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How chunk bytes travel to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadMode {
    /// Parallel `/ws/transfer` connections with pacing, pause and resume.
    /// Only one streamed upload runs per process.
    #[default]
    Streamed,
    /// Whole chunks as binary `upload_chunk` requests on the control channel.
    Control,
}

/// What to do when the server already knows the content under another name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail with [`UploadError::RenameConflict`](crate::UploadError::RenameConflict).
    #[default]
    Abort,
    /// Rename the stored record to the new filename and continue.
    Rename,
    /// Continue under the stored filename.
    KeepExisting,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Defaults to the file name of the local path.
    pub filename: Option<String>,
    pub mode: UploadMode,
    pub conflict: ConflictPolicy,
    /// Total bytes per second for streamed uploads; `None` asks the server.
    pub budget: Option<u64>,
    pub hash_timeout: Duration,
    /// Must match the server's chunk size.
    pub chunk_size: u64,
    pub fingerprint_window: u64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            filename: None,
            mode: UploadMode::default(),
            conflict: ConflictPolicy::default(),
            budget: None,
            hash_timeout: HASH_TIMEOUT,
            chunk_size: CHUNK_SIZE,
            fingerprint_window: FINGERPRINT_WINDOW,
        }
    }
}

/// Where the content hash of an upload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSource {
    Cache,
    Server,
    Computed,
}

/// Progress of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Hashing {
        percentage: u8,
    },
    HashResolved {
        file_hash: String,
        source: HashSource,
    },
    /// The server's view after a verify; `missing` chunks still need sending.
    Verified {
        id: u64,
        missing: usize,
    },
    Transferring {
        transferred: u64,
        percentage: u8,
    },
    Merging {
        percentage: u8,
    },
    Completed {
        id: u64,
    },
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub id: u64,
    pub file_hash: String,
    /// Filename the record ended up with.
    pub filename: String,
    pub size: u64,
    /// Chunks sent by this upload.
    pub uploaded_chunks: usize,
    /// The server already had the complete file.
    pub deduplicated: bool,
}
