//! Plain SSH sessions
//!
//! Every channel is a command exec'd on its own PTY. There is no control
//! channel behind an SSH session, so no payloads, no markers and no
//! re-attaching to surviving processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use t7_core::{
    Channel, ChannelTarget, Credentials, Failure, Session, SessionContext, SessionError,
    SessionEvent, SessionEvents, SessionState, TransportError,
};
use t7_protocol::{ChannelId, Marker};
use tokio::sync::mpsc;

use crate::channel::{lock, SshChannel};
use crate::transport::ssh::{SshTarget, SshTransport};

struct SshState {
    state: SessionState,
    transport: Option<SshTransport>,
    credentials: Option<Credentials>,
    channels: Vec<Weak<SshChannel>>,
}

/// A session backed by a single SSH connection
pub struct SshSession {
    ctx: SessionContext,
    target: SshTarget,
    term: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Mutex<SshState>,
    next_channel: AtomicU32,
}

impl SshSession {
    pub fn new(
        ctx: SessionContext,
        target: SshTarget,
        term: impl Into<String>,
    ) -> (Self, SessionEvents) {
        let (events_tx, events) = SessionEvents::channel();
        let session = Self {
            ctx,
            target,
            term: term.into(),
            events: events_tx,
            inner: Mutex::new(SshState {
                state: SessionState::New,
                transport: None,
                credentials: None,
                channels: Vec::new(),
            }),
            next_channel: AtomicU32::new(1),
        };
        (session, events)
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn set_state(&self, state: SessionState, failure: Option<Failure>) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == state && failure.is_none() {
                return;
            }
            inner.state = state;
        }
        match failure {
            Some(failure) => tracing::warn!("SSH session {}: {}", state, failure),
            None => tracing::info!("SSH session {}", state),
        }
        let _ = self.events.send(SessionEvent::StateChanged { state, failure });
    }

    /// Use an already authenticated connection, without reporting anything
    pub(crate) fn attach(&self, transport: SshTransport) {
        lock(&self.inner).transport = Some(transport);
    }

    fn transport(&self) -> Option<SshTransport> {
        lock(&self.inner)
            .transport
            .clone()
            .filter(|t| !t.is_closed())
    }
}

/// Connect and authenticate within the boarding watchdog
///
/// Failures come back as the state and failure to report.
pub(crate) async fn board(
    ctx: &SessionContext,
    target: &SshTarget,
    credentials: Option<&Credentials>,
    term: &str,
) -> Result<SshTransport, (SessionState, Failure)> {
    tracing::debug!("Connecting to {} as {}", target.address(), target.username);
    let attempt = SshTransport::connect(target, credentials, term);
    match tokio::time::timeout(ctx.net.connect_timeout, attempt).await {
        Ok(Ok(transport)) => Ok(transport),
        Ok(Err(e)) => {
            tracing::warn!("SSH connection to {} failed: {}", target.address(), e);
            Err(e.outcome())
        }
        Err(_) => Err((SessionState::Failed, Failure::TimedOut)),
    }
}

#[async_trait]
impl Session for SshSession {
    fn is_ssh(&self) -> bool {
        true
    }

    fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    fn marker(&self) -> Option<Marker> {
        None
    }

    async fn connect(
        &self,
        _marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        let credentials = {
            let mut inner = lock(&self.inner);
            if credentials.is_some() {
                inner.credentials = credentials;
            }
            inner.credentials.clone()
        };

        self.set_state(SessionState::Connecting, None);
        match board(&self.ctx, &self.target, credentials.as_ref(), &self.term).await {
            Ok(transport) => {
                self.attach(transport);
                self.set_state(SessionState::Connected, None);
            }
            Err((state, failure)) => self.set_state(state, Some(failure)),
        }
        Ok(())
    }

    async fn reconnect(
        &self,
        marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        self.close().await;
        self.connect(marker, credentials).await
    }

    async fn open_channel(&self, target: ChannelTarget) -> Result<Arc<dyn Channel>, SessionError> {
        let (command, size) = match target {
            ChannelTarget::Command { command, size, .. } => (command, size),
            ChannelTarget::Existing(_) => {
                return Err(SessionError::NotSupported(
                    "SSH sessions cannot re-attach to a channel",
                ))
            }
        };
        let transport = self
            .transport()
            .ok_or(SessionError::Transport(TransportError::Closed))?;

        let (stream, events) = transport.open_exec(&command, size).await?;
        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::SeqCst));
        let channel = SshChannel::new(id, stream, events);
        {
            let mut inner = lock(&self.inner);
            inner.channels.retain(|c| c.strong_count() > 0);
            inner.channels.push(Arc::downgrade(&channel));
        }
        tracing::debug!("Opened {} running {:?}", id, command);
        Ok(channel as Arc<dyn Channel>)
    }

    async fn get_payload(&self) -> Result<Option<String>, SessionError> {
        Ok(None)
    }

    async fn set_payload(&self, _payload: String) -> Result<(), SessionError> {
        tracing::debug!("SSH sessions do not store payloads");
        Ok(())
    }

    async fn disconnect(&self) -> Result<Option<Marker>, SessionError> {
        if self.transport().is_some() {
            return Err(SessionError::NotSupported(
                "SSH sessions cannot disconnect with a marker",
            ));
        }
        Ok(None)
    }

    async fn close(&self) {
        let (transport, channels) = {
            let mut inner = lock(&self.inner);
            (inner.transport.take(), std::mem::take(&mut inner.channels))
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.detach();
        }
        if let Some(transport) = transport {
            tracing::info!("Closing SSH connection to {}", self.target.address());
            transport.close().await;
        }
    }

    fn fail(&self, failure: Option<Failure>) {
        self.set_state(SessionState::Failed, failure);
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}
