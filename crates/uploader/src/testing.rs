//! In-process server used by the uploader tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chunkferry_file_store::{
    FileService, FixedDiskSpace, MemoryRecordStore, SharedBandwidth, StoreConfig,
};
use chunkferry_protocol::messages::{VerifyRequest, VerifyResponse};
use chunkferry_protocol::transfer::TransferTarget;
use chunkferry_upload_server::{ServerConfig, StorageHandler, TokenAuthenticator, UploadServer};

use crate::Endpoint;

pub(crate) const TOKEN: &str = "0123456789abcdef0123456789abcdef";

pub(crate) struct TestServer {
    dir: tempfile::TempDir,
    pub files: Arc<FileService>,
    server: Arc<UploadServer<StorageHandler>>,
    handle: tokio::task::JoinHandle<()>,
    port: u16,
}

impl TestServer {
    pub async fn start(chunk_size: u64) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = StoreConfig::new(&dir.path().join("store"));
        cfg.chunk_size = chunk_size;
        cfg.fingerprint_window = chunk_size;
        cfg.safety_margin = 0;
        let files = Arc::new(FileService::new(
            cfg,
            Arc::new(MemoryRecordStore::new()),
            Arc::new(FixedDiskSpace(u64::MAX)),
            Arc::new(SharedBandwidth::default()),
        ));
        files.init().await.unwrap();

        let config = ServerConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            transfer_idle_timeout: Duration::from_secs(5),
        };
        let server = UploadServer::new(
            config,
            StorageHandler::new(files.clone()),
            files.clone(),
            Arc::new(TokenAuthenticator::new(TOKEN)),
        );
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });

        let mut port = 0;
        for _ in 0..100 {
            port = server.port().await;
            if port != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_ne!(port, 0, "server did not bind");

        Self {
            dir,
            files,
            server,
            handle,
            port,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&format!("ws://127.0.0.1:{}", self.port), TOKEN).unwrap()
    }

    /// Writes a client-side file outside the store.
    pub fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let dir = self.dir.path().join("client");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Server-side `verify` for a client file.
    pub async fn verify(&self, path: &Path, target: &TransferTarget) -> VerifyResponse {
        let window = self.files.config().fingerprint_window;
        let fp = chunkferry_transfer::fingerprint(path, window).await.unwrap();
        let filename = path.file_name().unwrap().to_string_lossy().into_owned();
        self.files
            .verify(&VerifyRequest {
                filename,
                file_hash: target.file_hash.clone(),
                start_hash: fp.start_hash,
                end_hash: fp.end_hash,
                size: target.size,
            })
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
        self.handle.abort();
    }
}
