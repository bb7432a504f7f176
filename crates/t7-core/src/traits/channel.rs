//! Channel trait

use async_trait::async_trait;
use bytes::Bytes;
use t7_protocol::{ChannelId, TerminalSize};

use crate::error::SessionError;
use crate::types::ReadyState;

/// Consumer callback for inbound channel data
pub type MessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Consumer callback fired once when the peer closes the channel
pub type CloseHandler = Box<dyn FnOnce() + Send>;

/// One multiplexed duplex byte stream bound to one remote process
///
/// The channel's id is assigned by the remote peer and survives
/// reconnects; the stream underneath may be replaced or absent
/// (`ReadyState::Disconnected`).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable channel identifier
    fn id(&self) -> ChannelId;

    /// Readiness of the current stream
    fn ready_state(&self) -> ReadyState;

    /// Write bytes to the remote process
    async fn send(&self, data: Bytes) -> Result<(), SessionError>;

    /// Change the remote terminal geometry
    async fn resize(&self, size: TerminalSize) -> Result<(), SessionError>;

    /// Close the stream and forget the channel
    async fn close(&self) -> Result<(), SessionError>;

    /// Install the inbound data handler
    ///
    /// Data that arrived before a handler was installed is delivered to it
    /// immediately, in arrival order.
    fn on_message(&self, handler: MessageHandler);

    /// Install the remote close handler
    fn on_close(&self, handler: CloseHandler);
}
