//! Store error types.

use chunkferry_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_INSUFFICIENT_STORAGE,
    WS_ERR_CODE_INTERNAL, WS_ERR_CODE_NOT_FOUND,
};
use chunkferry_transfer::TransferError;

/// Errors produced by the record service, chunk store and merge engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient disk space: need {needed} bytes, {available} available")]
    Capacity { needed: u64, available: u64 },

    #[error("inconsistent state: {0}")]
    Consistency(String),

    #[error("no merge in progress for record {0}")]
    NothingToCancel(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("record store error: {0}")]
    Record(String),

    #[error("merge failed: {0}")]
    Merge(#[from] MergeFailure),
}

impl StoreError {
    /// Error code reported on the control channel.
    pub fn code(&self) -> i32 {
        match self {
            Self::Validation(_) => WS_ERR_CODE_BAD_REQUEST,
            Self::NotFound(_) => WS_ERR_CODE_NOT_FOUND,
            Self::Capacity { .. } => WS_ERR_CODE_INSUFFICIENT_STORAGE,
            Self::NothingToCancel(_) | Self::Cancelled => WS_ERR_CODE_CONFLICT,
            Self::Merge(failure) => failure.code(),
            Self::Io(_) | Self::Consistency(_) | Self::Record(_) => WS_ERR_CODE_INTERNAL,
        }
    }
}

impl From<TransferError> for StoreError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => Self::Io(e),
            TransferError::Cancelled => Self::Cancelled,
            other @ (TransferError::InvalidHash(_)
            | TransferError::InvalidFilename(_)
            | TransferError::InvalidSize(_)
            | TransferError::IndexOutOfRange { .. }) => Self::Validation(other.to_string()),
            other @ (TransferError::Timeout | TransferError::Worker(_)) => {
                Self::Consistency(other.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Record(err.to_string())
    }
}

/// Outcome of a background merge that did not finish.
///
/// Kept by the merge engine until the next `merge` call reports it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeFailure {
    #[error("disk full while merging")]
    DiskFull,

    #[error("merge cancelled")]
    Cancelled,

    #[error("merged size {actual} does not match expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("{0}")]
    Io(String),
}

impl MergeFailure {
    pub fn code(&self) -> i32 {
        match self {
            Self::DiskFull => WS_ERR_CODE_INSUFFICIENT_STORAGE,
            Self::Cancelled => WS_ERR_CODE_CONFLICT,
            Self::SizeMismatch { .. } | Self::Io(_) => WS_ERR_CODE_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(StoreError::Validation("x".into()).code(), 400);
        assert_eq!(StoreError::NotFound("x".into()).code(), 404);
        assert_eq!(
            StoreError::Capacity {
                needed: 2,
                available: 1
            }
            .code(),
            507
        );
        assert_eq!(StoreError::NothingToCancel(3).code(), 409);
        assert_eq!(StoreError::Consistency("x".into()).code(), 500);
        assert_eq!(StoreError::Merge(MergeFailure::DiskFull).code(), 507);
    }

    #[test]
    fn transfer_validation_maps_to_bad_request() {
        let err: StoreError = TransferError::InvalidHash("short".into()).into();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(err.code(), 400);
    }
}
