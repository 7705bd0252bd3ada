use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored file.
///
/// Transitions only move forward, except the recovery edge
/// `ChunkMerging -> ChunkUploaded` taken when a merge is cancelled or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileStatus {
    Init,
    ChunkUploading,
    ChunkUploaded,
    ChunkMerging,
    Finished,
}

impl From<FileStatus> for u8 {
    fn from(status: FileStatus) -> Self {
        match status {
            FileStatus::Init => 0,
            FileStatus::ChunkUploading => 1,
            FileStatus::ChunkUploaded => 2,
            FileStatus::ChunkMerging => 3,
            FileStatus::Finished => 4,
        }
    }
}

impl TryFrom<u8> for FileStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Init),
            1 => Ok(Self::ChunkUploading),
            2 => Ok(Self::ChunkUploaded),
            3 => Ok(Self::ChunkMerging),
            4 => Ok(Self::Finished),
            other => Err(format!("unknown file status {other}")),
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ChunkUploading => "chunk_uploading",
            Self::ChunkUploaded => "chunk_uploaded",
            Self::ChunkMerging => "chunk_merging",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Result of the last integrity spot-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CheckStatus {
    #[default]
    Unchecked,
    Verified,
    Failed,
}

impl From<CheckStatus> for u8 {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Unchecked => 0,
            CheckStatus::Verified => 1,
            CheckStatus::Failed => 2,
        }
    }
}

impl TryFrom<u8> for CheckStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unchecked),
            1 => Ok(Self::Verified),
            2 => Ok(Self::Failed),
            other => Err(format!("unknown check status {other}")),
        }
    }
}

/// One stored file identity, keyed by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: u64,
    pub filename: String,
    pub file_hash: String,
    pub start_hash: String,
    pub end_hash: String,
    pub file_path: String,
    pub size: u64,
    pub status: FileStatus,
    #[serde(default)]
    pub check_status: CheckStatus,
    #[serde(default)]
    pub outside_download: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cheap content fingerprint: hashes of the leading and trailing windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub start_hash: String,
    pub end_hash: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_status_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&FileStatus::Init).unwrap(), "0");
        assert_eq!(serde_json::to_string(&FileStatus::Finished).unwrap(), "4");
        let s: FileStatus = serde_json::from_str("3").unwrap();
        assert_eq!(s, FileStatus::ChunkMerging);
    }

    #[test]
    fn file_status_rejects_unknown_value() {
        assert!(serde_json::from_str::<FileStatus>("9").is_err());
    }

    #[test]
    fn check_status_defaults_to_unchecked() {
        assert_eq!(CheckStatus::default(), CheckStatus::Unchecked);
        assert_eq!(serde_json::to_string(&CheckStatus::Failed).unwrap(), "2");
    }

    #[test]
    fn record_uses_camel_case() {
        let now = Utc::now();
        let record = FileRecord {
            id: 7,
            filename: "movie.mkv".into(),
            file_hash: "a".repeat(32),
            start_hash: "b".repeat(32),
            end_hash: "c".repeat(32),
            file_path: "/data/files/aaa".into(),
            size: 42,
            status: FileStatus::ChunkUploading,
            check_status: CheckStatus::Unchecked,
            outside_download: false,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["fileHash"], "a".repeat(32));
        assert_eq!(json["status"], 1);
        assert_eq!(json["checkStatus"], 0);

        let back: FileRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
