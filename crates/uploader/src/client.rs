//! Control channel client.
//!
//! Request/response over one WebSocket with UUID correlation, keepalive
//! pings and typed helpers for every control operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chunkferry_protocol::binary::encode_binary_frame;
use chunkferry_protocol::constants::{
    CONTROL_PATH, MessageType, WS_BINARY_REQUEST_TIMEOUT, WS_REQUEST_TIMEOUT,
};
use chunkferry_protocol::envelope::Message;
use chunkferry_protocol::messages::{
    CheckResponse, ConfigPayload, DetailResponse, IdRequest, ListRequest, ListResponse,
    LookupResponse, MergeRequest, MergeResponse, OperationResult, RenameRequest,
    SetOutsideDownloadRequest, UploadChunkHeader, UploadChunkResponse, VerifyRequest,
    VerifyResponse,
};
use chunkferry_protocol::{CheckStatus, FileRecord, Fingerprint};

use crate::endpoint::ws_config;
use crate::{Endpoint, UploadError};

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Connection to a server's `/ws/control` route.
pub struct ControlClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl ControlClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, UploadError> {
        let request = endpoint.request(CONTROL_PATH, None)?;
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config()), false)
                .await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            cancel.clone(),
        ));

        tracing::debug!(url = endpoint.base_url(), "control channel connected");
        Ok(Self {
            write_tx,
            pending,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        })
    }

    /// `false` once the socket closed or [`close`](Self::close) was called.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Sends a request and waits for the response with the same id.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, UploadError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.exchange(id, tungstenite::Message::Text(json.into()), WS_REQUEST_TIMEOUT)
            .await
    }

    /// Sends a binary `upload_chunk` frame and waits for its response.
    ///
    /// The header's `id` is replaced with a fresh request id.
    pub async fn send_binary(
        &self,
        header: &UploadChunkHeader,
        data: &[u8],
    ) -> Result<Message, UploadError> {
        let id = uuid::Uuid::new_v4().to_string();
        let header = UploadChunkHeader {
            id: id.clone(),
            ..header.clone()
        };
        let frame = encode_binary_frame(&header, data)?;
        self.exchange(
            id,
            tungstenite::Message::Binary(frame.into()),
            WS_BINARY_REQUEST_TIMEOUT,
        )
        .await
    }

    async fn exchange(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, UploadError> {
        if !self.is_connected() {
            return Err(UploadError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(UploadError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(UploadError::Server {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(UploadError::Closed),
            Err(_) => Err(UploadError::Timeout),
        }
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        payload: Option<&Req>,
        expect: MessageType,
    ) -> Result<Resp, UploadError> {
        let resp = self.send_request(msg_type, payload).await?;
        parse_response(resp, expect)
    }

    pub async fn ping(&self) -> Result<(), UploadError> {
        let resp = self
            .send_request::<()>(MessageType::Ping, None)
            .await?;
        match resp.msg_type {
            MessageType::Pong => Ok(()),
            other => Err(UploadError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub async fn verify(&self, req: &VerifyRequest) -> Result<VerifyResponse, UploadError> {
        self.call(MessageType::Verify, Some(req), MessageType::VerifyResponse)
            .await
    }

    /// Content hash of a stored file with this fingerprint.
    pub async fn lookup(&self, fp: &Fingerprint) -> Result<Option<String>, UploadError> {
        let resp: LookupResponse = self
            .call(MessageType::Lookup, Some(fp), MessageType::LookupResponse)
            .await?;
        Ok(resp.file_hash)
    }

    pub async fn upload_chunk(
        &self,
        header: &UploadChunkHeader,
        data: &[u8],
    ) -> Result<UploadChunkResponse, UploadError> {
        let resp = self.send_binary(header, data).await?;
        parse_response(resp, MessageType::UploadChunkResponse)
    }

    /// Starts or polls a merge; returns the merge percentage.
    pub async fn merge(&self, file_hash: &str, size: u64) -> Result<u8, UploadError> {
        let req = MergeRequest {
            file_hash: file_hash.to_string(),
            size,
        };
        let resp: MergeResponse = self
            .call(MessageType::Merge, Some(&req), MessageType::MergeResponse)
            .await?;
        Ok(resp.percentage)
    }

    pub async fn cancel_merge(&self, id: u64) -> Result<(), UploadError> {
        self.operation(MessageType::CancelMerge, &IdRequest { id })
            .await
    }

    pub async fn check(&self, id: u64) -> Result<CheckStatus, UploadError> {
        let resp: CheckResponse = self
            .call(MessageType::Check, Some(&IdRequest { id }), MessageType::CheckResponse)
            .await?;
        Ok(resp.check_status)
    }

    pub async fn rename(&self, id: u64, filename: &str) -> Result<(), UploadError> {
        let req = RenameRequest {
            id,
            filename: filename.to_string(),
        };
        self.operation(MessageType::Rename, &req).await
    }

    pub async fn detail(&self, id: u64) -> Result<FileRecord, UploadError> {
        let resp: DetailResponse = self
            .call(MessageType::Detail, Some(&IdRequest { id }), MessageType::DetailResponse)
            .await?;
        Ok(resp.record)
    }

    pub async fn list(&self, req: &ListRequest) -> Result<ListResponse, UploadError> {
        self.call(MessageType::List, Some(req), MessageType::ListResponse)
            .await
    }

    pub async fn delete(&self, id: u64) -> Result<(), UploadError> {
        self.operation(MessageType::Delete, &IdRequest { id }).await
    }

    pub async fn set_outside_download(&self, id: u64, enabled: bool) -> Result<(), UploadError> {
        let req = SetOutsideDownloadRequest { id, enabled };
        self.operation(MessageType::SetOutsideDownload, &req).await
    }

    pub async fn get_config(&self) -> Result<ConfigPayload, UploadError> {
        self.call::<(), _>(MessageType::GetConfig, None, MessageType::ConfigResponse)
            .await
    }

    /// Sets the server-wide upload budget; returns the applied settings.
    pub async fn set_config(&self, config: &ConfigPayload) -> Result<ConfigPayload, UploadError> {
        self.call(MessageType::SetConfig, Some(config), MessageType::ConfigResponse)
            .await
    }

    async fn operation<Req: Serialize>(
        &self,
        msg_type: MessageType,
        req: &Req,
    ) -> Result<(), UploadError> {
        let result: OperationResult = self
            .call(msg_type, Some(req), MessageType::OperationResult)
            .await?;
        if result.success {
            Ok(())
        } else {
            Err(UploadError::Server {
                code: chunkferry_protocol::constants::WS_ERR_CODE_INTERNAL,
                message: result.message,
            })
        }
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}

fn parse_response<T: DeserializeOwned>(
    resp: Message,
    expect: MessageType,
) -> Result<T, UploadError> {
    if resp.msg_type != expect {
        return Err(UploadError::UnexpectedResponse(format!("{:?}", resp.msg_type)));
    }
    resp.parse_payload()?
        .ok_or_else(|| UploadError::UnexpectedResponse(format!("empty {expect:?}")))
}
