//! Channels multiplexed over a WebRTC peer connection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use t7_core::{Channel, CloseHandler, MessageHandler, ReadyState, SessionError};
use t7_protocol::{ChannelId, ControlRequest, TerminalSize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{lock, Inbound};
use crate::session::webrtc::Command;
use crate::transport::{DataStream, StreamEvent};

struct Binding {
    stream: Arc<dyn DataStream>,
    forwarder: JoinHandle<()>,
    generation: u64,
}

/// A channel whose data stream may be replaced or missing
///
/// Created by the session when the peer opens a stream for an
/// `add_pane`/`reconnect_pane` request. After a `disconnect` it stays
/// around, `disconnected`, until a reconnect binds a fresh stream to it.
pub struct WebRtcChannel {
    id: ChannelId,
    session: mpsc::WeakUnboundedSender<Command>,
    binding: Mutex<Option<Binding>>,
    closed: AtomicBool,
    inbound: Mutex<Inbound>,
}

impl WebRtcChannel {
    pub(crate) fn new(id: ChannelId, session: mpsc::WeakUnboundedSender<Command>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            binding: Mutex::new(None),
            closed: AtomicBool::new(false),
            inbound: Mutex::new(Inbound::default()),
        })
    }

    /// Attach a live stream, returning the one it replaces
    pub(crate) fn bind(
        self: &Arc<Self>,
        stream: Arc<dyn DataStream>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
        generation: u64,
    ) -> Option<Arc<dyn DataStream>> {
        let channel = Arc::downgrade(self);
        let session = self.session.clone();
        let id = self.id;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Message(data) => match Weak::upgrade(&channel) {
                        Some(channel) => channel.deliver(data),
                        None => return,
                    },
                    StreamEvent::Open => {}
                    StreamEvent::Closed => break,
                }
            }
            if let Some(session) = session.upgrade() {
                let _ = session.send(Command::StreamClosed { id, generation });
            }
        });

        self.closed.store(false, Ordering::SeqCst);
        let previous = lock(&self.binding).replace(Binding {
            stream,
            forwarder,
            generation,
        });
        tracing::debug!("Bound {} (generation {})", self.id, generation);
        previous.map(|old| {
            old.forwarder.abort();
            old.stream
        })
    }

    /// Drop the stream without firing anything, returning it for closing
    pub(crate) fn detach(&self) -> Option<Arc<dyn DataStream>> {
        let binding = lock(&self.binding).take()?;
        binding.forwarder.abort();
        tracing::debug!("Detached {}", self.id);
        Some(binding.stream)
    }

    /// Generation of the current binding
    pub(crate) fn generation(&self) -> Option<u64> {
        lock(&self.binding).as_ref().map(|b| b.generation)
    }

    /// The peer closed the stream
    pub(crate) fn remote_closed(&self) {
        lock(&self.binding).take();
        self.closed.store(true, Ordering::SeqCst);
        let handler = lock(&self.inbound).close();
        tracing::info!("{} closed by peer", self.id);
        if let Some(handler) = handler {
            handler();
        }
    }

    fn deliver(&self, data: Bytes) {
        lock(&self.inbound).deliver(data);
    }

    fn stream(&self) -> Option<Arc<dyn DataStream>> {
        lock(&self.binding).as_ref().map(|b| b.stream.clone())
    }
}

#[async_trait]
impl Channel for WebRtcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn ready_state(&self) -> ReadyState {
        if self.closed.load(Ordering::SeqCst) {
            return ReadyState::Closed;
        }
        match self.stream() {
            Some(stream) => stream.ready_state(),
            None => ReadyState::Disconnected,
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        let stream = self
            .stream()
            .ok_or(SessionError::ChannelDisconnected(self.id))?;
        stream.send(data).await?;
        Ok(())
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::Gone)?;
        let (reply, rx) = oneshot::channel();
        let request = ControlRequest::Resize {
            pane_id: self.id,
            size,
        };
        session
            .send(Command::Request { request, reply })
            .map_err(|_| SessionError::Gone)?;
        rx.await.map_err(|_| SessionError::Gone)??;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stream) = self.detach() {
            stream.close().await;
        }
        if let Some(session) = self.session.upgrade() {
            let _ = session.send(Command::ForgetChannel { id: self.id });
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        lock(&self.inbound).set_handler(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        let late = lock(&self.inbound).set_on_close(handler);
        if let Some(handler) = late {
            handler();
        }
    }
}

impl std::fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("id", &self.id)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
