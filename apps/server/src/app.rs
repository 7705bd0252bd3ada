//! Wires storage, the WebSocket server and configuration persistence.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chunkferry_file_store::{
    FileService, Fs2DiskSpace, JsonRecordStore, MergeEvent, SharedBandwidth, StoreConfig,
};
use chunkferry_upload_server::{ServerConfig, StorageHandler, TokenAuthenticator, UploadServer};
use tokio::sync::broadcast;

use crate::config::Config;

/// Runs the server until Ctrl-C.
pub async fn run(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let mut store_config = StoreConfig::new(&config.storage_dir);
    store_config.safety_margin = config.disk_safety_margin;

    let records = JsonRecordStore::open(&config.storage_dir.join("records.json"))?;
    let files = Arc::new(FileService::new(
        store_config,
        Arc::new(records),
        Arc::new(Fs2DiskSpace),
        Arc::new(SharedBandwidth::new(config.upload_bandwidth)),
    ));
    files.init().await?;
    tokio::spawn(log_merges(files.subscribe_merge_events()));

    let token = config.token.clone();
    let server_config = ServerConfig {
        bind_addr: config.listen,
        transfer_idle_timeout: Duration::from_secs(config.transfer_idle_timeout_secs),
    };

    // Bandwidth changed over the control channel outlives a restart.
    let saved = Arc::new(Mutex::new(config));
    let handler = StorageHandler::new(Arc::clone(&files)).with_config_listener(Box::new(
        move |payload| {
            let mut config = saved.lock().unwrap_or_else(PoisonError::into_inner);
            config.upload_bandwidth = payload.upload_bandwidth;
            match config.save(&config_path) {
                Ok(()) => tracing::info!(
                    upload_bandwidth = payload.upload_bandwidth,
                    "upload bandwidth saved"
                ),
                Err(e) => tracing::warn!("failed to save configuration: {e}"),
            }
        },
    ));

    let server = UploadServer::new(
        server_config,
        handler,
        Arc::clone(&files),
        Arc::new(TokenAuthenticator::new(token)),
    );
    let server_run = Arc::clone(&server);
    let mut serving = tokio::spawn(async move { server_run.run().await });

    while !serving.is_finished() {
        if let Some(addr) = server.local_addr().await {
            tracing::info!(%addr, "WebSocket server listening");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("SIGINT received, shutting down");
            server.shutdown();
            serving.await??;
        }
        result = &mut serving => result??,
    }
    Ok(())
}

async fn log_merges(mut events: broadcast::Receiver<MergeEvent>) {
    loop {
        match events.recv().await {
            Ok(MergeEvent::Started {
                id,
                file_hash,
                chunk_count,
            }) => tracing::debug!(id, %file_hash, chunk_count, "merge started"),
            Ok(MergeEvent::Progress {
                id,
                file_hash,
                percentage,
            }) => tracing::debug!(id, %file_hash, percentage, "merge progress"),
            Ok(MergeEvent::Failed {
                id,
                file_hash,
                failure,
            }) => tracing::warn!(id, %file_hash, "merge failed: {failure}"),
            Ok(MergeEvent::Finished { .. } | MergeEvent::Cancelled { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "merge events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
