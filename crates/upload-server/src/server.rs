//! Upload WebSocket server.
//!
//! Listens on a TCP port and routes each upgrade request by path: control
//! connections go to the [`Handler`], transfer and download connections are
//! served directly against the [`FileService`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chunkferry_file_store::FileService;
use chunkferry_protocol::constants::{
    CONTROL_PATH, DOWNLOAD_PATH, TRANSFER_IDLE_TIMEOUT, TRANSFER_PATH, WS_MAX_MESSAGE_SIZE,
};
use chunkferry_protocol::query::DownloadTarget;
use chunkferry_protocol::transfer::TransferTarget;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::auth::{Authenticator, request_token};
use crate::connection;
use crate::download::serve_download;
use crate::handler::Handler;
use crate::transfer::{TransferSession, serve_transfer};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind_addr: SocketAddr,
    /// Idle window for a partially received streamed chunk.
    pub transfer_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 0).into(),
            transfer_idle_timeout: TRANSFER_IDLE_TIMEOUT,
        }
    }
}

/// What an accepted upgrade request asked for.
#[derive(Debug)]
enum Route {
    Control,
    Transfer(TransferTarget),
    Download(DownloadTarget),
}

/// The upload WebSocket server.
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    files: Arc<FileService>,
    auth: Arc<dyn Authenticator>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    pub fn new(
        config: ServerConfig,
        handler: H,
        files: Arc<FileService>,
        auth: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            files,
            auth,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Gracefully shuts down the server and every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                match server.handle_connection(stream, peer_addr).await {
                                    Ok(()) => {}
                                    Err(ServerError::WebSocket(
                                        tokio_tungstenite::tungstenite::Error::Http(resp),
                                    )) => {
                                        tracing::debug!(%peer_addr, status = %resp.status(), "upgrade rejected");
                                    }
                                    Err(e) => tracing::error!(%peer_addr, "connection error: {e}"),
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and serves the requested route.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let mut route = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            route = Some(self.route(req)?);
            Ok(resp)
        };
        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        let Some(route) = route else {
            return Err(ServerError::ConnectionRejected("upgrade without route".into()));
        };
        tracing::debug!(%peer_addr, ?route, "WebSocket connection established");

        match route {
            Route::Control => {
                let conn = connection::spawn_connection(
                    ws_stream,
                    peer_addr,
                    Arc::clone(&self.handler),
                    self.cancel.clone(),
                );
                tracing::info!(peer_addr = %conn.peer_addr, "control connection opened");
                Ok(())
            }
            Route::Transfer(target) => {
                tracing::info!(%peer_addr, file_hash = %target.file_hash, size = target.size, "transfer connection opened");
                let session = TransferSession::new(Arc::clone(self.files.chunk_store()), target)?;
                serve_transfer(
                    ws_stream,
                    session,
                    self.config.transfer_idle_timeout,
                    self.cancel.child_token(),
                )
                .await
            }
            Route::Download(target) => {
                serve_download(ws_stream, &self.files, target, self.cancel.child_token()).await
            }
        }
    }

    /// Maps an upgrade request onto a [`Route`], or the HTTP error to answer with.
    fn route(&self, req: &Request) -> Result<Route, ErrorResponse> {
        let query = req.uri().query().unwrap_or("");
        match req.uri().path() {
            CONTROL_PATH => {
                self.authorize(req)?;
                Ok(Route::Control)
            }
            TRANSFER_PATH => {
                self.authorize(req)?;
                let target = TransferTarget::from_query(query)
                    .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "fileHash and size are required"))?;
                chunkferry_transfer::validate_file_hash(&target.file_hash)
                    .map_err(|e| reject(StatusCode::BAD_REQUEST, &e.to_string()))?;
                self.files
                    .config()
                    .plan(target.size)
                    .map_err(|e| reject(StatusCode::BAD_REQUEST, &e.to_string()))?;
                Ok(Route::Transfer(target))
            }
            DOWNLOAD_PATH => {
                let target = DownloadTarget::from_query(query)
                    .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "id or filename is required"))?;
                // Filename downloads are public; the record itself must opt in.
                if matches!(target, DownloadTarget::Id(_)) {
                    self.authorize(req)?;
                }
                Ok(Route::Download(target))
            }
            _ => Err(reject(StatusCode::NOT_FOUND, "no such route")),
        }
    }

    fn authorize(&self, req: &Request) -> Result<(), ErrorResponse> {
        if self.auth.authenticate(request_token(req).as_deref()) {
            Ok(())
        } else {
            Err(reject(StatusCode::UNAUTHORIZED, "missing or invalid token"))
        }
    }
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(message.to_string()));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use chunkferry_file_store::{FixedDiskSpace, MemoryRecordStore, SharedBandwidth, StoreConfig};
    use chunkferry_protocol::binary::encode_binary_frame;
    use chunkferry_protocol::envelope::Message;
    use chunkferry_protocol::messages::{
        DownloadHeader, MergeRequest, UploadChunkHeader, UploadChunkResponse, VerifyRequest,
        VerifyResponse,
    };
    use chunkferry_protocol::transfer::{TransferReply, encode_data_frame};
    use chunkferry_protocol::{FileStatus, MessageType};
    use chunkferry_transfer::hash_bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    use super::*;
    use crate::auth::TokenAuthenticator;
    use crate::control::StorageHandler;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    struct Fixture {
        _dir: tempfile::TempDir,
        files: Arc<FileService>,
        server: Arc<UploadServer<StorageHandler>>,
        handle: tokio::task::JoinHandle<()>,
        port: u16,
    }

    impl Fixture {
        async fn start() -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let mut cfg = StoreConfig::new(dir.path());
            cfg.chunk_size = 10;
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
            let server2 = Arc::clone(&server);
            let handle = tokio::spawn(async move {
                server2.run().await.unwrap();
            });

            tokio::time::sleep(Duration::from_millis(50)).await;
            let port = server.port().await;
            Self {
                _dir: dir,
                files,
                server,
                handle,
                port,
            }
        }

        fn url(&self, path_and_query: &str) -> String {
            format!("ws://127.0.0.1:{}{path_and_query}", self.port)
        }

        async fn connect(&self, path_and_query: &str) -> Client {
            let (ws, _) = tokio_tungstenite::connect_async(self.url(path_and_query))
                .await
                .unwrap();
            ws
        }

        async fn stop(self) {
            self.server.shutdown();
            self.handle.await.unwrap();
        }
    }

    /// Next text or close frame, skipping pings.
    async fn next_frame(ws: &mut Client) -> WsMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame timeout")
                .expect("stream ended")
                .unwrap();
            match msg {
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => return other,
            }
        }
    }

    async fn next_reply(ws: &mut Client) -> TransferReply {
        match next_frame(ws).await {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    async fn next_message(ws: &mut Client) -> Message {
        match next_frame(ws).await {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    fn text<T: serde::Serialize>(value: &T) -> WsMessage {
        WsMessage::Text(serde_json::to_string(value).unwrap().into())
    }

    fn transfer_query(file_hash: &str, size: u64) -> String {
        format!("{TRANSFER_PATH}?fileHash={file_hash}&size={size}&token={TOKEN}")
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let f = Fixture::start().await;
        assert!(f.port > 0, "should have bound to a dynamic port");
        assert_eq!(f.server.local_addr().await.unwrap().port(), f.port);
        f.stop().await;
    }

    #[tokio::test]
    async fn rejects_bad_upgrades() {
        let f = Fixture::start().await;

        let status = |r: Result<_, tokio_tungstenite::tungstenite::Error>| match r {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => resp.status(),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("upgrade should fail"),
        };

        let r = tokio_tungstenite::connect_async(f.url(CONTROL_PATH)).await;
        assert_eq!(status(r), StatusCode::UNAUTHORIZED);

        let r = tokio_tungstenite::connect_async(f.url(&format!("{CONTROL_PATH}?token=wrong"))).await;
        assert_eq!(status(r), StatusCode::UNAUTHORIZED);

        let r = tokio_tungstenite::connect_async(
            f.url(&format!("{TRANSFER_PATH}?fileHash=xyz&size=5&token={TOKEN}")),
        )
        .await;
        assert_eq!(status(r), StatusCode::BAD_REQUEST);

        let hash = "a".repeat(32);
        let r = tokio_tungstenite::connect_async(f.url(&transfer_query(&hash, 0))).await;
        assert_eq!(status(r), StatusCode::BAD_REQUEST);

        let r = tokio_tungstenite::connect_async(f.url(&format!("/ws/other?token={TOKEN}"))).await;
        assert_eq!(status(r), StatusCode::NOT_FOUND);

        let r = tokio_tungstenite::connect_async(f.url(&format!("{DOWNLOAD_PATH}?id=1"))).await;
        assert_eq!(status(r), StatusCode::UNAUTHORIZED);

        f.stop().await;
    }

    #[tokio::test]
    async fn transfer_streams_chunks() {
        let f = Fixture::start().await;
        let hash = "b".repeat(32);
        let mut ws = f.connect(&transfer_query(&hash, 25)).await;
        assert_eq!(next_reply(&mut ws).await, TransferReply::Ready);

        ws.send(text(&chunkferry_protocol::transfer::TransferAction::ChunkConfig {
            index: 1,
            size: 10,
        }))
        .await
        .unwrap();
        assert_eq!(next_reply(&mut ws).await, TransferReply::ChunkReady { index: 1 });

        ws.send(WsMessage::Binary(encode_data_frame(0, b"01234").into()))
            .await
            .unwrap();
        assert_eq!(
            next_reply(&mut ws).await,
            TransferReply::Continue {
                offset: 5,
                received: 5
            }
        );
        ws.send(WsMessage::Binary(encode_data_frame(5, b"56789").into()))
            .await
            .unwrap();
        assert_eq!(next_reply(&mut ws).await, TransferReply::ChunkComplete { index: 1 });

        ws.send(WsMessage::Text(r#"{"action":"reset"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_reply(&mut ws).await, TransferReply::Ready);

        let stored = std::fs::read(f.files.config().chunk_path(&hash, 1)).unwrap();
        assert_eq!(stored, b"0123456789");

        drop(ws);
        f.stop().await;
    }

    #[tokio::test]
    async fn transfer_offset_desync_closes_connection() {
        let f = Fixture::start().await;
        let hash = "c".repeat(32);
        let mut ws = f.connect(&transfer_query(&hash, 25)).await;
        assert_eq!(next_reply(&mut ws).await, TransferReply::Ready);

        ws.send(text(&chunkferry_protocol::transfer::TransferAction::ChunkConfig {
            index: 0,
            size: 10,
        }))
        .await
        .unwrap();
        next_reply(&mut ws).await;
        ws.send(WsMessage::Binary(encode_data_frame(4, b"xx").into()))
            .await
            .unwrap();

        match next_reply(&mut ws).await {
            TransferReply::Error { code, .. } => {
                assert_eq!(code, chunkferry_protocol::transfer::CODE_OFFSET_MISMATCH)
            }
            other => panic!("expected error, got {other:?}"),
        }
        match next_frame(&mut ws).await {
            WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4004),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(!f.files.config().chunk_path(&hash, 0).exists());

        f.stop().await;
    }

    #[tokio::test]
    async fn control_verify_and_upload_chunk() {
        let f = Fixture::start().await;
        let data: Vec<u8> = (0..25u8).collect();
        let file_hash = hash_bytes(&data);
        let mut ws = f.connect(&format!("{CONTROL_PATH}?token={TOKEN}")).await;

        let verify = VerifyRequest {
            filename: "data.bin".into(),
            file_hash: file_hash.clone(),
            start_hash: hash_bytes(&data),
            end_hash: hash_bytes(&data),
            size: 25,
        };
        let req = Message::new("v1", MessageType::Verify, Some(&verify)).unwrap();
        ws.send(text(&req)).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "v1");
        assert_eq!(reply.msg_type, MessageType::VerifyResponse);
        let outcome: VerifyResponse = reply.parse_payload().unwrap().unwrap();
        assert!(matches!(
            outcome,
            VerifyResponse::NeedUpload { ref uploaded_list, .. } if uploaded_list.is_empty()
        ));

        let header = UploadChunkHeader {
            id: "c2".into(),
            file_hash: file_hash.clone(),
            size: 25,
            chunk_index: 2,
        };
        let frame = encode_binary_frame(&header, &data[20..]).unwrap();
        ws.send(WsMessage::Binary(frame.into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "c2");
        let resp: UploadChunkResponse = reply.parse_payload().unwrap().unwrap();
        assert!(resp.accepted);
        assert!(!resp.duplicate);

        // Errors keep the request id.
        let bad = Message::new("m1", MessageType::Merge, Some(&serde_json::json!({"x": 1}))).unwrap();
        ws.send(text(&bad)).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "m1");
        assert_eq!(reply.error.unwrap().code, 400);

        drop(ws);
        f.stop().await;
    }

    async fn finished_file(f: &Fixture, data: &[u8], filename: &str) -> u64 {
        let file_hash = hash_bytes(data);
        let size = data.len() as u64;
        let verify = VerifyRequest {
            filename: filename.into(),
            file_hash: file_hash.clone(),
            start_hash: hash_bytes(data),
            end_hash: hash_bytes(data),
            size,
        };
        let outcome = f.files.verify(&verify).await.unwrap();
        let VerifyResponse::NeedUpload { id, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        for (index, chunk) in data.chunks(10).enumerate() {
            let header = UploadChunkHeader {
                id: String::new(),
                file_hash: file_hash.clone(),
                size,
                chunk_index: index as u64,
            };
            f.files.upload_chunk(&header, chunk).await.unwrap();
        }
        // Re-verify moves the record to uploaded once every chunk is present.
        f.files.verify(&verify).await.unwrap();
        let req = MergeRequest { file_hash, size };
        for _ in 0..100 {
            if f.files.merge(&req).await.unwrap() == 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.files.detail(id).unwrap().status, FileStatus::Finished);
        id
    }

    async fn read_download(ws: &mut Client) -> (DownloadHeader, Vec<u8>) {
        let header = match next_frame(ws).await {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected header, got {other:?}"),
        };
        let mut body = Vec::new();
        loop {
            match next_frame(ws).await {
                WsMessage::Binary(data) => body.extend_from_slice(&data),
                WsMessage::Close(frame) => {
                    assert_eq!(u16::from(frame.unwrap().code), 1000);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        (header, body)
    }

    #[tokio::test]
    async fn download_by_id_and_public_filename() {
        let f = Fixture::start().await;
        let data: Vec<u8> = (0..25u8).map(|b| b.wrapping_mul(7)).collect();
        let id = finished_file(&f, &data, "report.pdf").await;

        let mut ws = f.connect(&format!("{DOWNLOAD_PATH}?id={id}&token={TOKEN}")).await;
        let (header, body) = read_download(&mut ws).await;
        assert_eq!(header.filename, "report.pdf");
        assert_eq!(header.size, 25);
        assert_eq!(body, data);

        // Not published yet: the upgrade succeeds but the stream closes with 4404.
        let mut ws = f.connect(&format!("{DOWNLOAD_PATH}?filename=report.pdf")).await;
        match next_frame(&mut ws).await {
            WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4404),
            other => panic!("expected close, got {other:?}"),
        }

        f.files.set_outside_download(id, true).await.unwrap();
        let mut ws = f.connect(&format!("{DOWNLOAD_PATH}?filename=report.pdf")).await;
        let (_, body) = read_download(&mut ws).await;
        assert_eq!(body, data);

        f.stop().await;
    }
}
