//! Server-side storage for resumable chunked uploads.
//!
//! - [`RecordService`]: one [`FileRecord`](chunkferry_protocol::FileRecord)
//!   per content hash, moving through
//!   `Init -> ChunkUploading -> ChunkUploaded -> ChunkMerging -> Finished`.
//! - [`ChunkStore`]: idempotent chunk admission shared by every upload path.
//! - [`MergeEngine`]: background merge with a disk-space preflight and
//!   cancellation.
//! - [`IntegrityChecker`]: fingerprint spot-checks of merged files.
//!
//! [`FileService`] wires them together over a [`RecordStore`], a
//! [`DiskSpace`] source and a [`BandwidthSource`].

mod bandwidth;
mod chunks;
mod config;
mod disk;
mod error;
mod integrity;
mod locks;
mod merge;
mod record_store;
mod records;
mod service;

pub use bandwidth::{BandwidthSource, SharedBandwidth};
pub use chunks::{Admission, ChunkSink, ChunkStore};
pub use config::StoreConfig;
pub use disk::{DiskSpace, FixedDiskSpace, Fs2DiskSpace};
pub use error::{MergeFailure, StoreError};
pub use integrity::IntegrityChecker;
pub use locks::{HashGuard, RecordLocks};
pub use merge::{MergeEngine, MergeEvent};
pub use record_store::{JsonRecordStore, MemoryRecordStore, NewRecord, RecordQuery, RecordStore};
pub use records::RecordService;
pub use service::FileService;
