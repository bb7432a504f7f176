//! Channels backed by an SSH exec stream

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use t7_core::{Channel, CloseHandler, MessageHandler, ReadyState, SessionError};
use t7_protocol::{ChannelId, TerminalSize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{lock, Inbound};
use crate::transport::{DataStream, SshStream, StreamEvent};

/// One remote command running on its own PTY
pub struct SshChannel {
    id: ChannelId,
    stream: Arc<SshStream>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    inbound: Mutex<Inbound>,
}

impl SshChannel {
    pub(crate) fn new(
        id: ChannelId,
        stream: Arc<SshStream>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            id,
            stream,
            forwarder: Mutex::new(None),
            closed: AtomicBool::new(false),
            inbound: Mutex::new(Inbound::default()),
        });

        let weak = Arc::downgrade(&channel);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(channel) = Weak::upgrade(&weak) else {
                    return;
                };
                match event {
                    StreamEvent::Message(data) => lock(&channel.inbound).deliver(data),
                    StreamEvent::Open => {}
                    StreamEvent::Closed => {
                        channel.remote_closed();
                        return;
                    }
                }
            }
        });
        *lock(&channel.forwarder) = Some(forwarder);
        channel
    }

    /// Stop forwarding without firing `on_close`
    pub(crate) fn detach(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(forwarder) = lock(&self.forwarder).take() {
            forwarder.abort();
        }
    }

    fn remote_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handler = lock(&self.inbound).close();
        tracing::info!("{} closed by remote", self.id);
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[async_trait]
impl Channel for SshChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn ready_state(&self) -> ReadyState {
        if self.closed.load(Ordering::SeqCst) {
            ReadyState::Closed
        } else {
            self.stream.ready_state()
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelDisconnected(self.id));
        }
        self.stream.send(data).await?;
        Ok(())
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        self.stream.resize(size)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.detach();
        self.stream.close().await;
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

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("id", &self.id)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
