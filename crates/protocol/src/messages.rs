use serde::{Deserialize, Serialize};

use crate::types::{CheckStatus, FileRecord, Fingerprint};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Declares a file identity and asks which chunks the server already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub filename: String,
    pub file_hash: String,
    pub start_hash: String,
    pub end_hash: String,
    pub size: u64,
}

/// Looks up a stored content hash by fingerprint.
pub type LookupRequest = Fingerprint;

/// Header of a binary `upload_chunk` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkHeader {
    #[serde(default)]
    pub id: String,
    pub file_hash: String,
    pub size: u64,
    pub chunk_index: u64,
}

/// Starts or polls a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: String,
    pub size: u64,
}

/// Request addressing a record by id (`cancel_merge`, `check`, `detail`, `delete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdRequest {
    pub id: u64,
}

/// Renames a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameRequest {
    pub id: u64,
    pub filename: String,
}

/// Pages through completed records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

impl Default for ListRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
            filename: None,
        }
    }
}

/// Toggles the public by-filename download of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOutsideDownloadRequest {
    pub id: u64,
    pub enabled: bool,
}

/// Server-side transfer settings, used by both `get_config` and `set_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    /// Upload budget in bytes per second; 0 means unlimited.
    pub upload_bandwidth: u64,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Outcome of `verify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "result",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum VerifyResponse {
    /// The content is already stored under another filename.
    RenameConflict { id: u64, origin_filename: String },
    /// Nothing to upload.
    AlreadyComplete { id: u64 },
    /// Upload the complement of `uploaded_list`.
    NeedUpload {
        id: u64,
        #[serde(with = "index_list")]
        uploaded_list: Vec<u64>,
    },
}

/// Response to `lookup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

/// Response to a binary `upload_chunk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub accepted: bool,
    #[serde(default)]
    pub duplicate: bool,
}

/// Response to `merge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResponse {
    pub percentage: u8,
}

/// Response to `check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub check_status: CheckStatus,
}

/// Response to `detail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailResponse {
    pub record: FileRecord,
}

/// Response to `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub total: usize,
    pub records: Vec<FileRecord>,
}

/// Generic result for operations without a dedicated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// First text frame of a download stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadHeader {
    pub filename: String,
    pub size: u64,
}

/// Chunk indices travel as decimal strings (`["1","2"]`).
mod index_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(indices: &[u64], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(indices.iter().map(|i| i.to_string()))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Index {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u64>, D::Error> {
        let raw = Vec::<Index>::deserialize(de)?;
        raw.into_iter()
            .map(|i| match i {
                Index::Number(n) => Ok(n),
                Index::Text(s) => s.parse().map_err(serde::de::Error::custom),
            })
            .collect()
    }
}
