//! Background tasks driving a [`ControlClient`](crate::ControlClient) socket.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
