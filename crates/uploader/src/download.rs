//! Fetching stored files over `/ws/download`.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info};

use chunkferry_protocol::constants::DOWNLOAD_PATH;
use chunkferry_protocol::messages::DownloadHeader;
use chunkferry_protocol::query::DownloadTarget;

use crate::endpoint::ws_config;
use crate::{Endpoint, UploadError};

/// Downloads `target` to `dest`. When `dest` is a directory the file keeps
/// its stored filename. A partial file is removed on failure.
pub async fn download(
    endpoint: &Endpoint,
    target: &DownloadTarget,
    dest: &Path,
) -> Result<(DownloadHeader, PathBuf), UploadError> {
    let request = endpoint.request(DOWNLOAD_PATH, Some(&target.to_query()))?;
    let (mut ws, _) =
        tokio_tungstenite::connect_async_with_config(request, Some(ws_config()), false).await?;

    let header: DownloadHeader = loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => break serde_json::from_str(&text)?,
            Some(Ok(WsMessage::Close(frame))) => return Err(refused(frame)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(UploadError::Closed),
        }
    };

    let path = if tokio::fs::metadata(dest).await.is_ok_and(|m| m.is_dir()) {
        chunkferry_transfer::validate_filename(&header.filename)?;
        dest.join(&header.filename)
    } else {
        dest.to_path_buf()
    };
    debug!(filename = %header.filename, size = header.size, path = %path.display(), "download started");

    let mut file = tokio::fs::File::create(&path).await?;
    let result = async {
        let mut received = 0u64;
        while let Some(msg) = ws.next().await {
            match msg? {
                WsMessage::Binary(data) => {
                    file.write_all(&data).await?;
                    received += data.len() as u64;
                }
                WsMessage::Close(frame) => {
                    if let Some(frame) = frame.filter(|f| u16::from(f.code) >= 4000) {
                        return Err(refused(Some(frame)));
                    }
                    break;
                }
                _ => {}
            }
        }
        file.flush().await?;
        if received != header.size {
            return Err(UploadError::ShortDownload {
                expected: header.size,
                received,
            });
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }
    info!(filename = %header.filename, size = header.size, "download complete");
    Ok((header, path))
}

/// Close codes at or above 4000 carry `4000 + server error code`.
fn refused(
    frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame>,
) -> UploadError {
    match frame {
        Some(frame) if u16::from(frame.code) >= 4000 => UploadError::Server {
            code: i32::from(u16::from(frame.code) - 4000),
            message: frame.reason.as_str().to_string(),
        },
        _ => UploadError::Closed,
    }
}
