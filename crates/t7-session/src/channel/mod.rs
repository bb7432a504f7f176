//! Channel implementations
//!
//! [`WebRtcChannel`] keeps its identity across reconnects while the data
//! stream underneath is swapped or absent. [`SshChannel`] is bound to one
//! exec stream for its whole life.

pub mod ssh;
pub mod webrtc;

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use t7_core::{CloseHandler, MessageHandler};

pub use self::ssh::SshChannel;
pub use self::webrtc::WebRtcChannel;

/// Consumer-facing callback slots of a channel
///
/// Data that arrives before a message handler is installed is held back
/// and replayed, in order, when one is.
#[derive(Default)]
pub(crate) struct Inbound {
    handler: Option<MessageHandler>,
    buffered: VecDeque<Bytes>,
    on_close: Option<CloseHandler>,
    closed: bool,
}

impl Inbound {
    pub fn deliver(&mut self, data: Bytes) {
        match &self.handler {
            Some(handler) => handler(data),
            None => self.buffered.push_back(data),
        }
    }

    pub fn set_handler(&mut self, handler: MessageHandler) {
        for data in self.buffered.drain(..) {
            handler(data);
        }
        self.handler = Some(handler);
    }

    /// Install the close handler, returning it if the close already happened
    #[must_use]
    pub fn set_on_close(&mut self, handler: CloseHandler) -> Option<CloseHandler> {
        if self.closed {
            return Some(handler);
        }
        self.on_close = Some(handler);
        None
    }

    /// Record a remote close and hand out the handler to fire
    #[must_use]
    pub fn close(&mut self) -> Option<CloseHandler> {
        self.closed = true;
        self.on_close.take()
    }
}

/// Lock a std mutex, ignoring poisoning
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
