pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod query;
pub mod transfer;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use types::{CheckStatus, FileRecord, FileStatus, Fingerprint};
