use chunkferry_protocol::constants::{HASH_HEX_LEN, MAX_FILENAME_LEN};

use crate::TransferError;

/// Validates a lowercase hex MD5 digest.
///
/// Content hashes double as directory and file names on the server, so
/// anything outside `[0-9a-f]{32}` is rejected before touching the disk.
pub fn validate_file_hash(hash: &str) -> Result<(), TransferError> {
    if hash.len() != HASH_HEX_LEN {
        return Err(TransferError::InvalidHash(format!(
            "expected {HASH_HEX_LEN} hex characters, got {}",
            hash.len()
        )));
    }
    if !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TransferError::InvalidHash(format!(
            "not lowercase hex: {hash}"
        )));
    }
    Ok(())
}

/// Validates a client-asserted filename.
///
/// Rejects empty names, names longer than [`MAX_FILENAME_LEN`] characters,
/// path separators and control characters.
pub fn validate_filename(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidFilename("empty filename".into()));
    }
    if name.chars().count() > MAX_FILENAME_LEN {
        return Err(TransferError::InvalidFilename(format!(
            "longer than {MAX_FILENAME_LEN} characters"
        )));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(TransferError::InvalidFilename(format!(
            "forbidden character in {name:?}"
        )));
    }
    if name == "." || name == ".." {
        return Err(TransferError::InvalidFilename(format!("reserved name {name}")));
    }
    Ok(())
}

/// Validates a declared file size.
pub fn validate_size(size: u64) -> Result<(), TransferError> {
    if size == 0 {
        return Err(TransferError::InvalidSize("file size must be at least 1 byte".into()));
    }
    Ok(())
}
