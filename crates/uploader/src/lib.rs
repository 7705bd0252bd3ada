//! Client side of chunkferry.
//!
//! [`ControlClient`] speaks the `/ws/control` request/response protocol.
//! [`Uploader`] drives a whole upload over it: fingerprint and hash the
//! file, verify with the server, send the missing chunks and merge. Chunks
//! travel either as `upload_chunk` requests or, in the default streamed
//! mode, through a [`TransferPool`] of `/ws/transfer` connections sharing a
//! bandwidth budget. [`download`] fetches merged files back.

mod client;
mod connection;
mod download;
mod endpoint;
mod error;
mod gate;
mod pacing;
mod pool;
mod pumps;
mod queue;
mod types;
mod uploader;

#[cfg(test)]
mod testing;

pub use client::ControlClient;
pub use connection::ConnectionReport;
pub use download::download;
pub use endpoint::Endpoint;
pub use error::UploadError;
pub use gate::{TransferGate, TransferPermit};
pub use pacing::Pacing;
pub use pool::{PoolOutcome, TransferEvent, TransferPool, connection_count, split_budget};
pub use queue::{ChunkQueue, Claim};
pub use types::{
    ConflictPolicy, HASH_TIMEOUT, HashSource, UploadEvent, UploadMode, UploadOptions,
    UploadOutcome,
};
pub use uploader::{CONTROL_CONCURRENCY, Uploader};
