//! SSH-bootstrapped WebRTC sessions
//!
//! A hybrid session logs in over SSH, starts the signaling helper
//! (`accept_command`) on the remote host and tunnels WebRTC signaling
//! through the helper's terminal. Once the inner WebRTC session connects,
//! every operation is forwarded to it. When the helper is missing or fails
//! to start, the session stays a plain SSH session instead of failing.

use std::future::pending;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use t7_core::{
    Channel, ChannelTarget, Credentials, Failure, Session, SessionContext, SessionError,
    SessionEvent, SessionEvents, SessionState,
};
use t7_protocol::{Marker, TerminalSize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ssh::{board, SshSession};
use super::webrtc::WebRtcSession;
use crate::channel::lock;
use crate::signaling::{SentLog, SignalMessage, TunnelEvent, TunnelParser, TunnelSignaling};
use crate::transport::ssh::SshTarget;
use crate::transport::{DataStream, PeerConnector, RtcConnector, StreamEvent};

/// The signaling helper's terminal: what we write to and what it prints
pub type HelperStream = (Arc<dyn DataStream>, mpsc::UnboundedReceiver<StreamEvent>);

/// Logs in and starts the signaling helper
#[async_trait]
pub trait HelperLauncher: Send + Sync {
    /// Board `ssh` and start the helper on it
    ///
    /// `Ok(None)` means the login worked but the helper did not start; the
    /// session then carries on as plain SSH. `Err` ends boarding.
    async fn launch(
        &self,
        ssh: &SshSession,
        credentials: Option<&Credentials>,
    ) -> Result<Option<HelperStream>, (SessionState, Failure)>;
}

/// Runs `accept_command` over a real SSH login
pub struct SshLauncher {
    ctx: SessionContext,
    target: SshTarget,
    term: String,
    accept_command: String,
}

impl SshLauncher {
    pub fn new(
        ctx: SessionContext,
        target: SshTarget,
        term: impl Into<String>,
        accept_command: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            target,
            term: term.into(),
            accept_command: accept_command.into(),
        }
    }
}

#[async_trait]
impl HelperLauncher for SshLauncher {
    async fn launch(
        &self,
        ssh: &SshSession,
        credentials: Option<&Credentials>,
    ) -> Result<Option<HelperStream>, (SessionState, Failure)> {
        let transport = board(&self.ctx, &self.target, credentials, &self.term).await?;
        ssh.attach(transport.clone());
        match transport
            .open_exec(&self.accept_command, TerminalSize::default())
            .await
        {
            Ok((setup, output)) => {
                let setup: Arc<dyn DataStream> = setup;
                Ok(Some((setup, output)))
            }
            Err(e) => {
                tracing::info!("Signaling helper did not start ({}), staying on SSH", e);
                Ok(None)
            }
        }
    }
}

struct Shared {
    ctx: SessionContext,
    target: SshTarget,
    launcher: Arc<dyn HelperLauncher>,
    connector: Arc<dyn PeerConnector>,
    events: mpsc::UnboundedSender<SessionEvent>,
    ssh: SshSession,
    delegate: RwLock<Option<Arc<WebRtcSession>>>,
    state: Mutex<SessionState>,
    credentials: Mutex<Option<Credentials>>,
}

impl Shared {
    fn set_state(&self, state: SessionState, failure: Option<Failure>) {
        {
            let mut current = lock(&self.state);
            if *current == state && failure.is_none() {
                return;
            }
            *current = state;
        }
        match failure {
            Some(failure) => tracing::warn!("Hybrid session {}: {}", state, failure),
            None => tracing::info!("Hybrid session {}", state),
        }
        let _ = self.events.send(SessionEvent::StateChanged { state, failure });
    }

    fn delegate(&self) -> Option<Arc<WebRtcSession>> {
        self.delegate
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_delegate(&self, session: Option<Arc<WebRtcSession>>) -> Option<Arc<WebRtcSession>> {
        let mut delegate = self.delegate.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *delegate, session)
    }

    /// Forward an event of the inner session as our own
    fn forward(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { state, failure } => self.set_state(state, failure),
            SessionEvent::PayloadUpdated(payload) => {
                let _ = self.events.send(SessionEvent::PayloadUpdated(payload));
            }
        }
    }
}

/// A session that upgrades itself from SSH to WebRTC
pub struct HybridSession {
    shared: Arc<Shared>,
    bootstrap: Mutex<Option<JoinHandle<()>>>,
}

impl HybridSession {
    /// Hybrid session using the `webrtc` crate for the upgrade
    pub fn new(
        ctx: SessionContext,
        target: SshTarget,
        term: impl Into<String>,
        accept_command: impl Into<String>,
    ) -> (Self, SessionEvents) {
        Self::with_connector(ctx, target, term, accept_command, Arc::new(RtcConnector))
    }

    pub fn with_connector(
        ctx: SessionContext,
        target: SshTarget,
        term: impl Into<String>,
        accept_command: impl Into<String>,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, SessionEvents) {
        let term = term.into();
        let launcher = SshLauncher::new(ctx.clone(), target.clone(), term.clone(), accept_command);
        Self::with_launcher(ctx, target, term, Arc::new(launcher), connector)
    }

    /// Hybrid session reaching the helper through `launcher`
    pub fn with_launcher(
        ctx: SessionContext,
        target: SshTarget,
        term: impl Into<String>,
        launcher: Arc<dyn HelperLauncher>,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, SessionEvents) {
        let (events_tx, events) = SessionEvents::channel();
        // Boarding is reported by the hybrid session itself
        let (ssh, _) = SshSession::new(ctx.clone(), target.clone(), term);
        let shared = Arc::new(Shared {
            ctx,
            target,
            launcher,
            connector,
            events: events_tx,
            ssh,
            delegate: RwLock::new(None),
            state: Mutex::new(SessionState::New),
            credentials: Mutex::new(None),
        });
        let session = Self {
            shared,
            bootstrap: Mutex::new(None),
        };
        (session, events)
    }

    /// Tear down the current bootstrap, inner session and SSH connection
    async fn teardown(&self) {
        if let Some(task) = lock(&self.bootstrap).take() {
            task.abort();
        }
        if let Some(inner) = self.shared.set_delegate(None) {
            inner.close().await;
        }
        self.shared.ssh.close().await;
    }
}

async fn next_event(inner: &mut Option<(Arc<WebRtcSession>, SessionEvents)>) -> Option<SessionEvent> {
    match inner {
        Some((_, events)) => events.recv().await,
        None => pending().await,
    }
}

async fn next_output(
    output: &mut Option<mpsc::UnboundedReceiver<StreamEvent>>,
) -> Option<StreamEvent> {
    match output {
        Some(output) => output.recv().await,
        None => pending().await,
    }
}

/// Log in and start the helper, then upgrade over it
async fn bootstrap(shared: Arc<Shared>, marker: Option<Marker>, credentials: Option<Credentials>) {
    match shared.launcher.launch(&shared.ssh, credentials.as_ref()).await {
        Ok(Some(helper)) => upgrade(shared, helper, marker).await,
        Ok(None) => shared.set_state(SessionState::Connected, None),
        Err((state, failure)) => shared.set_state(state, Some(failure)),
    }
}

/// Drive signaling through the helper until the inner session connects;
/// afterwards keep forwarding its events
async fn upgrade(shared: Arc<Shared>, helper: HelperStream, marker: Option<Marker>) {
    let (setup, output) = helper;
    let sent = SentLog::default();
    let mut parser = TunnelParser::new(sent.clone());
    let signaling = Arc::new(TunnelSignaling::new(setup.clone(), sent));
    let mut output = Some(output);
    let mut inner: Option<(Arc<WebRtcSession>, SessionEvents)> = None;

    let deadline = tokio::time::sleep(shared.ctx.net.connect_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("Timed out waiting for WebRTC over the SSH tunnel");
                setup.close().await;
                if let Some((session, _)) = inner.take() {
                    session.close().await;
                }
                shared.ssh.close().await;
                shared.set_state(SessionState::Failed, Some(Failure::TimedOut));
                return;
            }
            event = next_output(&mut output) => match event {
                Some(StreamEvent::Message(data)) => {
                    for event in parser.feed(&data) {
                        match event {
                            TunnelEvent::Ready => {
                                if inner.is_some() {
                                    continue;
                                }
                                tracing::info!("Signaling helper ready");
                                let (session, events) = WebRtcSession::new(
                                    shared.ctx.clone(),
                                    shared.connector.clone(),
                                    signaling.clone(),
                                );
                                if let Err(e) = session.connect(marker, None).await {
                                    tracing::warn!("Failed to start WebRTC session: {}", e);
                                }
                                inner = Some((Arc::new(session), events));
                            }
                            TunnelEvent::HelperMissing => {
                                shared.ctx.notify("webexec not found, using plain SSH");
                                setup.close().await;
                                shared.set_state(SessionState::Connected, None);
                                return;
                            }
                            TunnelEvent::Payload(payload) => {
                                signaling.deliver(SignalMessage::from(payload));
                            }
                        }
                    }
                }
                Some(StreamEvent::Open) => {}
                Some(StreamEvent::Closed) | None => {
                    output = None;
                    if inner.is_none() {
                        tracing::info!("Signaling helper exited before READY, staying on SSH");
                        shared.set_state(SessionState::Connected, None);
                        return;
                    }
                    tracing::debug!("Signaling helper exited");
                }
            },
            event = next_event(&mut inner) => match event {
                Some(SessionEvent::StateChanged { state, failure }) if state.is_boarded() => {
                    if let Some((session, events)) = inner.take() {
                        setup.close().await;
                        shared.set_delegate(Some(session));
                        shared.forward(SessionEvent::StateChanged { state: SessionState::Connected, failure });
                        forward_events(shared, events).await;
                    }
                    return;
                }
                Some(SessionEvent::StateChanged { state, failure }) if state.is_failure() => {
                    setup.close().await;
                    shared.set_state(state, failure);
                    return;
                }
                Some(SessionEvent::StateChanged { .. }) => {}
                Some(event) => shared.forward(event),
                None => inner = None,
            },
        }
    }
}

async fn forward_events(shared: Arc<Shared>, mut events: SessionEvents) {
    while let Some(event) = events.recv().await {
        shared.forward(event);
    }
}

#[async_trait]
impl Session for HybridSession {
    fn is_ssh(&self) -> bool {
        self.shared.delegate().is_none()
    }

    fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    fn marker(&self) -> Option<Marker> {
        self.shared.delegate().and_then(|inner| inner.marker())
    }

    async fn connect(
        &self,
        marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        self.teardown().await;
        let credentials = {
            let mut stored = lock(&self.shared.credentials);
            if credentials.is_some() {
                *stored = credentials;
            }
            stored.clone()
        };
        self.shared.set_state(SessionState::Connecting, None);
        let task = tokio::spawn(bootstrap(self.shared.clone(), marker, credentials));
        *lock(&self.bootstrap) = Some(task);
        Ok(())
    }

    async fn reconnect(
        &self,
        marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        let marker = marker.or_else(|| self.marker());
        self.connect(marker, credentials).await
    }

    async fn open_channel(&self, target: ChannelTarget) -> Result<Arc<dyn Channel>, SessionError> {
        match self.shared.delegate() {
            Some(inner) => inner.open_channel(target).await,
            None => self.shared.ssh.open_channel(target).await,
        }
    }

    async fn get_payload(&self) -> Result<Option<String>, SessionError> {
        match self.shared.delegate() {
            Some(inner) => inner.get_payload().await,
            None => self.shared.ssh.get_payload().await,
        }
    }

    async fn set_payload(&self, payload: String) -> Result<(), SessionError> {
        match self.shared.delegate() {
            Some(inner) => inner.set_payload(payload).await,
            None => self.shared.ssh.set_payload(payload).await,
        }
    }

    async fn disconnect(&self) -> Result<Option<Marker>, SessionError> {
        match self.shared.delegate() {
            Some(inner) => inner.disconnect().await,
            None => self.shared.ssh.disconnect().await,
        }
    }

    async fn close(&self) {
        self.teardown().await;
    }

    fn fail(&self, failure: Option<Failure>) {
        match self.shared.delegate() {
            Some(inner) => inner.fail(failure),
            None => self.shared.set_state(SessionState::Failed, failure),
        }
    }
}

impl std::fmt::Debug for HybridSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridSession")
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .field("is_ssh", &self.is_ssh())
            .finish()
    }
}
