//! `/ws/download`: streams a merged file as binary slices.

use std::time::Duration;

use chunkferry_file_store::FileService;
use chunkferry_protocol::constants::DOWNLOAD_SLICE_SIZE;
use chunkferry_protocol::messages::DownloadHeader;
use chunkferry_protocol::query::DownloadTarget;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::transfer::close_message;

/// How long to wait for the peer to acknowledge our close frame.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

pub(crate) async fn serve_download<S>(
    mut ws: S,
    files: &FileService,
    target: DownloadTarget,
    cancel: CancellationToken,
) -> Result<(), ServerError>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let opened = match &target {
        DownloadTarget::Id(id) => files.open_download(*id).await,
        DownloadTarget::Filename(name) => files.open_public_download(name).await,
    };
    let (record, mut file) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::debug!(?target, "download refused: {e}");
            let code = 4000 + e.code().clamp(0, 999) as u16;
            ws.send(close_message(code, &e.to_string())).await?;
            linger(&mut ws).await;
            return Ok(());
        }
    };

    let header = DownloadHeader {
        filename: record.filename.clone(),
        size: record.size,
    };
    ws.send(WsMessage::Text(serde_json::to_string(&header)?.into()))
        .await?;

    let mut sent = 0u64;
    let mut buf = vec![0u8; DOWNLOAD_SLICE_SIZE];
    loop {
        if cancel.is_cancelled() {
            ws.send(close_message(1001, "server shutting down")).await?;
            return Ok(());
        }
        let n = fill(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        ws.send(WsMessage::Binary(buf[..n].to_vec().into())).await?;
        sent += n as u64;
    }

    tracing::info!(id = record.id, filename = %record.filename, bytes = sent, "download complete");
    ws.send(close_message(1000, "")).await?;
    linger(&mut ws).await;
    Ok(())
}

/// Reads until `buf` is full or the file ends.
async fn fill(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Drains the stream until the peer answers the close handshake.
async fn linger<S>(ws: &mut S)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_LINGER, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}
