//! Sessions over a WebRTC peer connection
//!
//! The session handle is a thin front for an engine task (see
//! [`engine`]); every operation is a message to that task. Boarding
//! outcomes are reported on the [`SessionEvents`] returned at
//! construction.

mod engine;

use std::sync::Arc;

use async_trait::async_trait;
use t7_core::{
    Channel, ChannelTarget, Credentials, Failure, Session, SessionContext, SessionError,
    SessionEvents, SessionState,
};
use t7_protocol::control::payload_from_body;
use t7_protocol::{ControlRequest, Marker};
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) use engine::Command;
use engine::Engine;

use crate::peerbook::PeerbookConnection;
use crate::signaling::{BrokerSignaling, HttpSignaling, Signaling};
use crate::transport::{PeerConnector, RtcConnector};

/// State mirrored out of the engine for synchronous getters
#[derive(Debug, Clone, Copy)]
pub(crate) struct Status {
    pub state: SessionState,
    pub marker: Option<Marker>,
}

/// A resumable, multiplexed session over WebRTC
///
/// Dropping the last handle closes the session.
pub struct WebRtcSession {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
}

impl WebRtcSession {
    /// Session over an arbitrary connector and signaling strategy
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        ctx: SessionContext,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn Signaling>,
    ) -> (Self, SessionEvents) {
        let (events_tx, events) = SessionEvents::channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(Status {
            state: SessionState::New,
            marker: None,
        });
        let engine = Engine::new(
            ctx,
            connector,
            signaling,
            commands_rx,
            commands.downgrade(),
            events_tx,
            status_tx,
        );
        tokio::spawn(engine.run());
        (Self { commands, status }, events)
    }

    /// Session to the peer with fingerprint `target`, signaling via peerbook
    pub fn over_peerbook(
        ctx: SessionContext,
        peerbook: PeerbookConnection,
        target: impl Into<String>,
    ) -> (Self, SessionEvents) {
        let signaling = BrokerSignaling::new(peerbook, target);
        Self::new(ctx, Arc::new(RtcConnector), Arc::new(signaling))
    }

    /// Session to the host at `address`, signaling over HTTP
    pub fn over_http(ctx: SessionContext, address: &str) -> (Self, SessionEvents) {
        let signaling = HttpSignaling::new(address, &ctx);
        Self::new(ctx, Arc::new(RtcConnector), Arc::new(signaling))
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionError::Gone)?;
        rx.await.map_err(|_| SessionError::Gone)
    }

    async fn request(&self, request: ControlRequest) -> Result<serde_json::Value, SessionError> {
        self.call(|reply| Command::Request { request, reply })
            .await?
    }
}

impl std::fmt::Debug for WebRtcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = *self.status.borrow();
        f.debug_struct("WebRtcSession")
            .field("state", &status.state)
            .field("marker", &status.marker)
            .finish()
    }
}

#[async_trait]
impl Session for WebRtcSession {
    fn is_ssh(&self) -> bool {
        false
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn marker(&self) -> Option<Marker> {
        self.status.borrow().marker
    }

    async fn connect(
        &self,
        marker: Option<Marker>,
        _credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        self.commands
            .send(Command::Connect { marker })
            .map_err(|_| SessionError::Gone)
    }

    async fn reconnect(
        &self,
        marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        self.connect(marker.or_else(|| self.marker()), credentials)
            .await
    }

    async fn open_channel(&self, target: ChannelTarget) -> Result<Arc<dyn Channel>, SessionError> {
        let channel: Arc<dyn Channel> = self
            .call(|reply| Command::OpenChannel { target, reply })
            .await??;
        Ok(channel)
    }

    async fn get_payload(&self) -> Result<Option<String>, SessionError> {
        let body = self.request(ControlRequest::GetPayload).await?;
        Ok(payload_from_body(&body))
    }

    async fn set_payload(&self, payload: String) -> Result<(), SessionError> {
        self.request(ControlRequest::SetPayload { payload }).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<Option<Marker>, SessionError> {
        self.call(|reply| Command::Disconnect { reply }).await?
    }

    async fn close(&self) {
        if self.call(|reply| Command::Close { reply }).await.is_err() {
            tracing::debug!("Session already gone");
        }
    }

    fn fail(&self, failure: Option<Failure>) {
        let _ = self.commands.send(Command::Fail(failure));
    }
}
