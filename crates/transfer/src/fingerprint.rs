use std::io::{Read, SeekFrom};
use std::path::Path;
use std::time::Duration;

use chunkferry_protocol::Fingerprint;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;
use crate::validation::validate_size;

/// Read buffer used while hashing (1 MiB).
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// MD5 of `data` as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Hashes the leading and trailing `window` bytes of a file.
///
/// Cost is bounded by the window, not the file size. When the file is not
/// larger than the window both hashes cover the whole content and are equal.
pub async fn fingerprint(path: &Path, window: u64) -> Result<Fingerprint, TransferError> {
    if window == 0 {
        return Err(TransferError::InvalidSize("fingerprint window must be positive".into()));
    }

    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    validate_size(size)?;

    let len = window.min(size);
    let start_hash = hash_range(&mut file, 0, len).await?;
    let end_hash = if len == size {
        start_hash.clone()
    } else {
        hash_range(&mut file, size - len, len).await?
    };

    Ok(Fingerprint {
        start_hash,
        end_hash,
        size,
    })
}

async fn hash_range(
    file: &mut tokio::fs::File,
    offset: u64,
    len: u64,
) -> Result<String, TransferError> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; (len as usize).min(HASH_BUFFER_SIZE)];
    let mut remaining = len;
    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        file.read_exact(&mut buf[..want]).await?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the MD5 of an entire file on a blocking worker.
///
/// `progress` receives whole percentages as the file is read. Cancelling
/// `cancel` stops the worker at the next buffer boundary; exceeding `timeout`
/// cancels it too. Either way no partial hash is returned.
pub async fn hash_file(
    path: &Path,
    progress: Option<watch::Sender<u8>>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<String, TransferError> {
    let worker_cancel = cancel.child_token();
    let token = worker_cancel.clone();
    let owned = path.to_path_buf();
    let task =
        tokio::task::spawn_blocking(move || hash_file_blocking(&owned, progress.as_ref(), &token));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(TransferError::Worker(e.to_string())),
        Err(_) => {
            worker_cancel.cancel();
            warn!(path = %path.display(), ?timeout, "full-file hash timed out");
            Err(TransferError::Timeout)
        }
    }
}

fn hash_file_blocking(
    path: &Path,
    progress: Option<&watch::Sender<u8>>,
    cancel: &CancellationToken,
) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    validate_size(size)?;

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut processed: u64 = 0;
    let mut last_pct = 0u8;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        processed += n as u64;

        let pct = (processed.min(size) * 100 / size) as u8;
        if pct != last_pct {
            last_pct = pct;
            if let Some(tx) = progress {
                let _ = tx.send(pct);
            }
        }
    }

    let digest = hex::encode(hasher.finalize());
    debug!(path = %path.display(), size, hash = %digest, "full-file hash computed");
    Ok(digest)
}
