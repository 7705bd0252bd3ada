//! [`Handler`] backed by a [`FileService`].

use std::sync::Arc;

use chunkferry_file_store::{FileService, StoreError};
use chunkferry_protocol::MessageType;
use chunkferry_protocol::binary::ChunkFrame;
use chunkferry_protocol::envelope::Message;
use chunkferry_protocol::messages::{
    CheckResponse, ConfigPayload, DetailResponse, IdRequest, ListRequest, ListResponse,
    LookupRequest, LookupResponse, MergeRequest, MergeResponse, OperationResult, RenameRequest,
    SetOutsideDownloadRequest, UploadChunkResponse, VerifyRequest,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};

/// Callback invoked after `set_config` changed the server settings.
pub type ConfigListener = Box<dyn Fn(&ConfigPayload) + Send + Sync>;

/// Serves every control request from one shared [`FileService`].
pub struct StorageHandler {
    files: Arc<FileService>,
    on_config: Option<ConfigListener>,
}

impl StorageHandler {
    pub fn new(files: Arc<FileService>) -> Self {
        Self {
            files,
            on_config: None,
        }
    }

    /// Registers a callback for accepted `set_config` requests, e.g. to persist them.
    pub fn with_config_listener(mut self, listener: ConfigListener) -> Self {
        self.on_config = Some(listener);
        self
    }

    pub fn files(&self) -> &Arc<FileService> {
        &self.files
    }

    fn config_payload(&self) -> ConfigPayload {
        ConfigPayload {
            upload_bandwidth: self.files.upload_bandwidth(),
        }
    }
}

/// Parses a required payload; a missing or malformed one is a bad request.
fn payload<T: DeserializeOwned>(msg: &Message) -> Result<T, StoreError> {
    msg.parse_payload::<T>()
        .map_err(|e| StoreError::Validation(format!("invalid payload: {e}")))?
        .ok_or_else(|| StoreError::Validation("missing payload".into()))
}

/// Sends `result` as a `msg_type` reply, or its error as an error reply.
fn respond<T: Serialize>(
    sender: &Sender,
    msg: &Message,
    msg_type: MessageType,
    result: Result<T, StoreError>,
) {
    let reply = match result {
        Ok(body) => match msg.reply(msg_type, Some(&body)) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("failed to encode {msg_type:?}: {e}");
                return;
            }
        },
        Err(e) => {
            if e.code() >= 500 {
                tracing::error!(id = %msg.id, "{:?} failed: {e}", msg.msg_type);
            } else {
                tracing::debug!(id = %msg.id, "{:?} rejected: {e}", msg.msg_type);
            }
            msg.reply_error(e.code(), e.to_string())
        }
    };
    let _ = sender.send_msg(reply);
}

fn done() -> OperationResult {
    OperationResult {
        success: true,
        message: String::new(),
    }
}

impl Handler for StorageHandler {
    fn on_verify(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<VerifyRequest>(&msg) {
                Ok(req) => self.files.verify(&req).await,
                Err(e) => Err(e),
            };
            respond(&sender, &msg, MessageType::VerifyResponse, result);
        })
    }

    fn on_lookup(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = payload::<LookupRequest>(&msg)
                .and_then(|fp| self.files.lookup(&fp))
                .map(|file_hash| LookupResponse { file_hash });
            respond(&sender, &msg, MessageType::LookupResponse, result);
        })
    }

    fn on_upload_chunk(&self, sender: Sender, frame: ChunkFrame) -> HandlerFuture<'_> {
        Box::pin(async move {
            let ChunkFrame { header, data } = frame;
            let result = self
                .files
                .upload_chunk(&header, &data)
                .await
                .map(|admission| UploadChunkResponse {
                    accepted: true,
                    duplicate: admission.is_duplicate(),
                });
            let request = Message {
                id: header.id,
                msg_type: MessageType::UploadChunk,
                payload: None,
                error: None,
            };
            respond(&sender, &request, MessageType::UploadChunkResponse, result);
        })
    }

    fn on_merge(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<MergeRequest>(&msg) {
                Ok(req) => self.files.merge(&req).await,
                Err(e) => Err(e),
            }
            .map(|percentage| MergeResponse { percentage });
            respond(&sender, &msg, MessageType::MergeResponse, result);
        })
    }

    fn on_cancel_merge(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<IdRequest>(&msg) {
                Ok(req) => self.files.cancel_merge(req.id).await,
                Err(e) => Err(e),
            }
            .map(|()| done());
            respond(&sender, &msg, MessageType::OperationResult, result);
        })
    }

    fn on_check(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<IdRequest>(&msg) {
                Ok(req) => self.files.check(req.id).await,
                Err(e) => Err(e),
            }
            .map(|check_status| CheckResponse { check_status });
            respond(&sender, &msg, MessageType::CheckResponse, result);
        })
    }

    fn on_rename(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<RenameRequest>(&msg) {
                Ok(req) => self.files.rename(req.id, &req.filename).await,
                Err(e) => Err(e),
            }
            .map(|()| done());
            respond(&sender, &msg, MessageType::OperationResult, result);
        })
    }

    fn on_detail(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = payload::<IdRequest>(&msg)
                .and_then(|req| self.files.detail(req.id))
                .map(|record| DetailResponse { record });
            respond(&sender, &msg, MessageType::DetailResponse, result);
        })
    }

    fn on_list(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            // An absent payload lists the first page with defaults.
            let result = msg
                .parse_payload::<ListRequest>()
                .map_err(|e| StoreError::Validation(format!("invalid payload: {e}")))
                .and_then(|req| self.files.list(&req.unwrap_or_default()))
                .map(|(total, records)| ListResponse { total, records });
            respond(&sender, &msg, MessageType::ListResponse, result);
        })
    }

    fn on_delete(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<IdRequest>(&msg) {
                Ok(req) => self.files.delete(req.id).await,
                Err(e) => Err(e),
            }
            .map(|()| done());
            respond(&sender, &msg, MessageType::OperationResult, result);
        })
    }

    fn on_set_outside_download(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<SetOutsideDownloadRequest>(&msg) {
                Ok(req) => self.files.set_outside_download(req.id, req.enabled).await,
                Err(e) => Err(e),
            }
            .map(|()| done());
            respond(&sender, &msg, MessageType::OperationResult, result);
        })
    }

    fn on_get_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result: Result<_, StoreError> = Ok(self.config_payload());
            respond(&sender, &msg, MessageType::ConfigResponse, result);
        })
    }

    fn on_set_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = payload::<ConfigPayload>(&msg).map(|req| {
                self.files.set_upload_bandwidth(req.upload_bandwidth);
                let applied = self.config_payload();
                if let Some(listener) = &self.on_config {
                    listener(&applied);
                }
                applied
            });
            respond(&sender, &msg, MessageType::ConfigResponse, result);
        })
    }
}
