//! Handler trait for control channel requests.
//!
//! Implementors provide the storage logic while the server framework
//! handles connection management, routing and the binary chunk frames.

use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::MessageType;
use chunkferry_protocol::binary::ChunkFrame;
use chunkferry_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use chunkferry_protocol::envelope::Message;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling control channel requests from an uploader.
///
/// Every method receives a `sender` for the reply and the parsed request.
/// Requests are dispatched concurrently, so replies may arrive out of order;
/// clients correlate them by envelope id.
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `verify`.
    fn on_verify(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `lookup`.
    fn on_lookup(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for a binary `upload_chunk` frame.
    ///
    /// The reply id is taken from the frame header.
    fn on_upload_chunk(&self, sender: Sender, frame: ChunkFrame) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                frame.header.id,
                WS_ERR_CODE_NOT_IMPLEMENTED,
                "not implemented",
            ));
        })
    }

    /// Called for `merge`.
    fn on_merge(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `cancel_merge`.
    fn on_cancel_merge(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `check`.
    fn on_check(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `rename`.
    fn on_rename(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `detail`.
    fn on_detail(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `list`.
    fn on_list(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `delete`.
    fn on_delete(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `set_outside_download`.
    fn on_set_outside_download(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `get_config`.
    fn on_get_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `set_config`.
    fn on_set_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called when a control connection closes (cleanup hook).
    fn on_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}

fn not_implemented<'a>(sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}
