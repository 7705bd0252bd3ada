//! Chunk planning, fingerprinting and input validation.
//!
//! Shared by the uploader (which plans and hashes local files) and the file
//! store (which re-derives the same plan to validate chunks on disk and
//! re-hashes fingerprint windows during integrity checks).

mod cache;
mod chunked;
mod fingerprint;
mod planner;
mod progress;
mod validation;

pub use cache::{FINGERPRINT_CACHE_CAPACITY, FingerprintCache};
pub use chunked::ChunkReader;
pub use fingerprint::{fingerprint, hash_bytes, hash_file};
pub use planner::{ChunkPlan, ChunkSpan};
pub use progress::{ChunkProgress, SpeedCalculator};
pub use validation::{validate_file_hash, validate_filename, validate_size};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("chunk index {index} out of range (chunk count {count})")]
    IndexOutOfRange { index: u64, count: u64 },

    #[error("hashing cancelled")]
    Cancelled,

    #[error("hashing timed out")]
    Timeout,

    #[error("hash worker failed: {0}")]
    Worker(String),
}
