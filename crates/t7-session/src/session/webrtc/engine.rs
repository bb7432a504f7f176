//! The task behind a [`WebRtcSession`](super::WebRtcSession)
//!
//! One engine task owns the peer connection, the control channel tables
//! and the channel map. Handles talk to it through [`Command`]s; transport
//! events, signaling messages and watchdogs arrive on the same select loop,
//! so every correlation table has a single owner.

use std::collections::HashMap;
use std::future::{pending, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use t7_core::{ChannelTarget, Failure, SessionContext, SessionError, SessionEvent, SessionState};
use t7_protocol::control::payload_from_body;
use t7_protocol::{
    ChannelId, ChannelLabel, ControlReply, ControlRequest, InboundControl, Marker, MessageId,
    CONTROL_LABEL,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tokio_util::time::{delay_queue, DelayQueue};

use super::Status;
use crate::channel::WebRtcChannel;
use crate::control::ControlChannel;
use crate::signaling::{SignalMessage, Signaling};
use crate::transport::{DataStream, PeerConnection, PeerConnector, PeerEvent, PeerState, StreamEvent};

/// ICE error code for a TURN server rejecting our credentials
const ICE_AUTH_ERROR: u16 = 401;

pub(crate) type OpenReply = oneshot::Sender<Result<Arc<WebRtcChannel>, SessionError>>;

/// Requests from session and channel handles
pub(crate) enum Command {
    Connect {
        marker: Option<Marker>,
    },
    OpenChannel {
        target: ChannelTarget,
        reply: OpenReply,
    },
    Request {
        request: ControlRequest,
        reply: oneshot::Sender<Result<Value, SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<Option<Marker>, SessionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Fail(Option<Failure>),
    /// A channel's stream was closed by the peer
    StreamClosed {
        id: ChannelId,
        generation: u64,
    },
    /// A channel was closed by its consumer
    ForgetChannel {
        id: ChannelId,
    },
}

/// What to do with the answer to a control message
pub(crate) enum Responder {
    Reply(oneshot::Sender<Result<Value, SessionError>>),
    Mark(oneshot::Sender<Result<Option<Marker>, SessionError>>),
    Restore,
    /// The open completes when the stream arrives, see [`PendingOpens`]
    Open,
}

impl Responder {
    fn reject(self, error: SessionError) {
        match self {
            Responder::Reply(tx) => {
                let _ = tx.send(Err(error));
            }
            Responder::Mark(tx) => {
                let _ = tx.send(Err(error));
            }
            Responder::Restore | Responder::Open => {}
        }
    }
}

/// Channel opens waiting for their stream
///
/// Keyed by the id of the `add_pane`/`reconnect_pane` message, which the
/// peer echoes in the stream label. Each entry has its own watchdog,
/// armed when the open is requested.
struct PendingOpens {
    timeout: Duration,
    entries: HashMap<MessageId, (OpenReply, delay_queue::Key)>,
    watchdogs: DelayQueue<MessageId>,
}

impl PendingOpens {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
            watchdogs: DelayQueue::new(),
        }
    }

    fn insert(&mut self, id: MessageId, reply: OpenReply) {
        let key = self.watchdogs.insert(id, self.timeout);
        self.entries.insert(id, (reply, key));
    }

    fn take(&mut self, id: MessageId) -> Option<OpenReply> {
        let (reply, key) = self.entries.remove(&id)?;
        self.watchdogs.remove(&key);
        Some(reply)
    }

    fn ids(&self) -> Vec<MessageId> {
        self.entries.keys().copied().collect()
    }

    fn drain(&mut self) -> Vec<OpenReply> {
        self.watchdogs.clear();
        self.entries.drain().map(|(_, (reply, _))| reply).collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn next_expired(&mut self) -> (MessageId, OpenReply) {
        loop {
            let id = poll_fn(|cx| match self.watchdogs.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
                _ => Poll::Pending,
            })
            .await;
            if let Some((reply, _)) = self.entries.remove(&id) {
                return (id, reply);
            }
        }
    }
}

async fn recv_from<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

pub(crate) struct Engine {
    ctx: SessionContext,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn Signaling>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Sender<Status>,

    state: SessionState,
    marker: Option<Marker>,
    /// Marker to restore once the transport connects
    restoring: Option<Marker>,
    ice_retried: bool,

    peer: Option<Arc<dyn PeerConnection>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    signals: Option<mpsc::UnboundedReceiver<SignalMessage>>,
    control_stream: Option<Arc<dyn DataStream>>,
    control_events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    control_open: bool,
    connect_deadline: Option<Pin<Box<Sleep>>>,

    control: ControlChannel<Responder>,
    opens: PendingOpens,
    channels: HashMap<ChannelId, Arc<WebRtcChannel>>,
    generation: u64,
}

impl Engine {
    pub(crate) fn new(
        ctx: SessionContext,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn Signaling>,
        commands: mpsc::UnboundedReceiver<Command>,
        handle: mpsc::WeakUnboundedSender<Command>,
        events: mpsc::UnboundedSender<SessionEvent>,
        status: watch::Sender<Status>,
    ) -> Self {
        let control = ControlChannel::new(ctx.net.timeout, ctx.net.queue_capacity);
        let opens = PendingOpens::new(ctx.net.timeout);
        Self {
            ctx,
            connector,
            signaling,
            commands,
            handle,
            events,
            status,
            state: SessionState::New,
            marker: None,
            restoring: None,
            ice_retried: false,
            peer: None,
            peer_events: None,
            signals: None,
            control_stream: None,
            control_events: None,
            control_open: false,
            connect_deadline: None,
            control,
            opens,
            channels: HashMap::new(),
            generation: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = recv_from(&mut self.peer_events) => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => self.peer_events = None,
                },
                signal = recv_from(&mut self.signals) => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => self.signals = None,
                },
                event = recv_from(&mut self.control_events) => match event {
                    Some(event) => self.on_control_event(event).await,
                    None => self.control_events = None,
                },
                (id, responder) = self.control.next_expired() => {
                    self.on_control_timeout(id, responder).await;
                }
                (id, reply) = self.opens.next_expired() => {
                    tracing::warn!("Timed out opening channel for message {}", id);
                    let _ = reply.send(Err(SessionError::Failed(Failure::TimedOut)));
                }
                _ = expire(&mut self.connect_deadline) => {
                    self.connect_deadline = None;
                    tracing::warn!("Timed out connecting");
                    self.abort(SessionState::Failed, Some(Failure::TimedOut)).await;
                }
            }
        }
        tracing::debug!("Session handle dropped, shutting down");
        self.close().await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { marker } => self.connect(marker).await,
            Command::OpenChannel { target, reply } => self.open_channel(target, reply).await,
            Command::Request { request, reply } => {
                self.submit(request, Responder::Reply(reply)).await
            }
            Command::Disconnect { reply } => self.disconnect(reply).await,
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
            Command::Fail(failure) => self.abort(SessionState::Failed, failure).await,
            Command::StreamClosed { id, generation } => {
                let current = self.channels.get(&id).and_then(|c| c.generation());
                if current == Some(generation) {
                    if let Some(channel) = self.channels.remove(&id) {
                        channel.remote_closed();
                    }
                }
            }
            Command::ForgetChannel { id } => {
                if self.channels.remove(&id).is_some() {
                    tracing::debug!("Forgot {}", id);
                }
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(Status {
            state: self.state,
            marker: self.marker,
        });
    }

    fn set_state(&mut self, state: SessionState, failure: Option<Failure>) {
        if self.state == state && failure.is_none() {
            return;
        }
        match failure {
            Some(failure) => tracing::warn!("Session {}: {}", state, failure),
            None => tracing::info!("Session {}", state),
        }
        self.state = state;
        self.publish();
        let _ = self.events.send(SessionEvent::StateChanged { state, failure });
    }

    async fn connect(&mut self, marker: Option<Marker>) {
        self.release_peer().await;
        if marker.is_some() {
            self.marker = marker;
        }
        self.restoring = marker;
        self.ice_retried = false;
        self.set_state(SessionState::Connecting, None);
        self.start_attempt().await;
    }

    /// Create the peer connection and the control stream
    async fn start_attempt(&mut self) {
        let servers = self.ctx.ice.ice_servers().await;
        let (peer, events) = match self.connector.connect(&servers).await {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!("Failed to create peer connection: {}", e);
                self.abort(SessionState::Failed, Some(Failure::FailedToConnect))
                    .await;
                return;
            }
        };
        self.peer = Some(peer.clone());
        self.peer_events = Some(events);

        match self.signaling.open().await {
            Ok(signals) => self.signals = Some(signals),
            Err(e) => {
                tracing::warn!("Failed to open signaling: {}", e);
                self.abort(SessionState::Failed, Some(Failure::FailedToConnect))
                    .await;
                return;
            }
        }

        match peer.create_data_stream(CONTROL_LABEL).await {
            Ok((stream, events)) => {
                self.control_stream = Some(stream);
                self.control_events = Some(events);
                self.control_open = false;
            }
            Err(e) => {
                tracing::warn!("Failed to create control stream: {}", e);
                self.abort(SessionState::Failed, Some(Failure::FailedToConnect))
                    .await;
                return;
            }
        }

        self.connect_deadline = Some(Box::pin(tokio::time::sleep(self.ctx.net.connect_timeout)));
    }

    /// Drop the current transport, keeping queued requests and channels
    ///
    /// Messages already sent on the old control stream can no longer be
    /// answered and are failed, together with opens that were waiting on
    /// them.
    async fn release_peer(&mut self) {
        self.connect_deadline = None;
        for channel in self.channels.values() {
            if let Some(stream) = channel.detach() {
                stream.close().await;
            }
        }

        for responder in self.control.fail_in_flight() {
            responder.reject(SessionError::Failed(Failure::DataChannelLost));
        }
        for id in self.opens.ids() {
            if !self.control.is_queued(id) {
                if let Some(reply) = self.opens.take(id) {
                    let _ = reply.send(Err(SessionError::Failed(Failure::DataChannelLost)));
                }
            }
        }

        self.control_open = false;
        self.control_events = None;
        if let Some(stream) = self.control_stream.take() {
            stream.close().await;
        }
        self.signals = None;
        self.peer_events = None;
        if let Some(peer) = self.peer.take() {
            tracing::debug!("Closing peer connection");
            peer.close().await;
        }
    }

    /// End the boarding attempt or session in `state`
    async fn abort(&mut self, state: SessionState, failure: Option<Failure>) {
        let reason = failure.unwrap_or(Failure::Aborted);
        for responder in self.control.fail_all() {
            responder.reject(SessionError::Failed(reason));
        }
        for reply in self.opens.drain() {
            let _ = reply.send(Err(SessionError::Failed(reason)));
        }
        self.restoring = None;
        self.release_peer().await;
        self.set_state(state, failure);
    }

    /// Release everything without reporting; the session reads as
    /// disconnected afterwards
    ///
    /// Requests submitted after closing stay queued, with no watchdog,
    /// until the next connect.
    async fn close(&mut self) {
        if self.peer.is_none() && self.control.pending_len() == 0 && self.opens.is_empty() {
            return;
        }
        tracing::info!("Closing session");
        for responder in self.control.fail_all() {
            responder.reject(SessionError::Failed(Failure::Aborted));
        }
        for reply in self.opens.drain() {
            let _ = reply.send(Err(SessionError::Failed(Failure::Aborted)));
        }
        self.restoring = None;
        self.release_peer().await;
        self.channels.clear();
        if self.state != SessionState::New && !self.state.is_failure() {
            self.state = SessionState::Disconnected;
            self.publish();
        }
    }

    async fn disconnect(
        &mut self,
        reply: oneshot::Sender<Result<Option<Marker>, SessionError>>,
    ) {
        if self.peer.is_none() {
            let _ = reply.send(Ok(self.marker));
            return;
        }
        for channel in self.channels.values() {
            if let Some(stream) = channel.detach() {
                stream.close().await;
            }
        }
        self.submit(ControlRequest::Mark, Responder::Mark(reply))
            .await;
    }

    async fn open_channel(&mut self, target: ChannelTarget, reply: OpenReply) {
        let request = match target {
            ChannelTarget::Command {
                command,
                parent,
                size,
            } => ControlRequest::AddPane {
                command: vec![command],
                size,
                parent,
            },
            ChannelTarget::Existing(id) => ControlRequest::ReconnectPane { id },
        };
        match self.control.submit(&request, Responder::Open) {
            Ok(id) => {
                self.opens.insert(id, reply);
                self.flush().await;
            }
            Err(rejected) => {
                let _ = reply.send(Err(rejected.error));
            }
        }
    }

    async fn submit(&mut self, request: ControlRequest, responder: Responder) {
        match self.control.submit(&request, responder) {
            Ok(_) => self.flush().await,
            Err(rejected) => rejected.handler.reject(rejected.error),
        }
    }

    /// Write queued control messages if the control stream is open
    async fn flush(&mut self) {
        if !self.control_open {
            return;
        }
        let Some(stream) = self.control_stream.clone() else {
            return;
        };
        for (id, payload) in self.control.take_outbound() {
            tracing::debug!("Sending control message {}: {}", id, payload);
            if let Err(e) = stream.send(Bytes::from(payload)).await {
                // The watchdog stays armed and reports the loss
                tracing::warn!("Failed to send control message {}: {}", id, e);
                self.ctx
                    .notify(&format!("Sending control message failed: {}", e));
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        tracing::trace!("Peer event {:?}", event);
        match event {
            PeerEvent::StateChanged(state) => self.on_peer_state(state).await,
            PeerEvent::NegotiationNeeded => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                let offer = match peer.create_offer().await {
                    Ok(offer) => offer,
                    Err(e) => {
                        tracing::warn!("Failed to create offer: {}", e);
                        self.abort(SessionState::Failed, Some(Failure::FailedToConnect))
                            .await;
                        return;
                    }
                };
                if let Err(e) = self.signaling.send_offer(&offer).await {
                    tracing::warn!("Failed to send offer: {}", e);
                    self.abort(SessionState::Failed, Some(Failure::FailedToConnect))
                        .await;
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = self.signaling.send_candidate(&candidate).await {
                    tracing::debug!("Failed to send ICE candidate: {}", e);
                }
            }
            PeerEvent::IceCandidateError { code } => {
                if code == ICE_AUTH_ERROR && !self.ice_retried {
                    self.ice_retried = true;
                    self.ctx.notify("Getting fresh ICE servers");
                    self.ctx.ice.refresh().await;
                    self.release_peer().await;
                    self.start_attempt().await;
                } else {
                    tracing::debug!("ICE candidate error {}", code);
                }
            }
            PeerEvent::StreamOpened { stream, events } => {
                self.on_stream_opened(stream, events).await
            }
        }
    }

    async fn on_peer_state(&mut self, state: PeerState) {
        match state {
            PeerState::Connected => {
                self.connect_deadline = None;
                match self.restoring.take() {
                    Some(marker) => {
                        tracing::info!("Restoring from marker {}", marker);
                        self.submit(ControlRequest::Restore { marker }, Responder::Restore)
                            .await;
                    }
                    None => self.set_state(SessionState::Connected, None),
                }
            }
            PeerState::Failed => {
                self.abort(SessionState::Failed, Some(Failure::FailedToConnect))
                    .await
            }
            PeerState::New => self.set_state(SessionState::New, None),
            PeerState::Connecting => self.set_state(SessionState::Connecting, None),
            PeerState::Disconnected => self.set_state(SessionState::Disconnected, None),
            PeerState::Closed => tracing::debug!("Peer connection closed"),
        }
    }

    async fn on_signal(&mut self, signal: SignalMessage) {
        match signal {
            SignalMessage::Description(description) => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                tracing::debug!("Got remote {:?}", description.kind);
                if let Err(e) = peer.set_remote_description(description).await {
                    tracing::warn!("Failed to set remote description: {}", e);
                    self.abort(SessionState::Failed, Some(Failure::BadRemoteDescription))
                        .await;
                }
            }
            SignalMessage::Candidate(candidate) => {
                if let Some(peer) = self.peer.clone() {
                    if let Err(e) = peer.add_ice_candidate(candidate).await {
                        tracing::debug!("Failed to add ICE candidate: {}", e);
                    }
                }
            }
            SignalMessage::Failed(Failure::Unauthorized) => {
                self.abort(SessionState::Unauthorized, Some(Failure::Unauthorized))
                    .await
            }
            SignalMessage::Failed(failure) => {
                self.abort(SessionState::Failed, Some(failure)).await
            }
        }
    }

    async fn on_stream_opened(
        &mut self,
        stream: Arc<dyn DataStream>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let label = stream.label().to_string();
        if label == CONTROL_LABEL {
            return;
        }
        let label = match ChannelLabel::parse(&label) {
            Ok(label) => label,
            Err(e) => {
                tracing::warn!("{}", e);
                self.ctx.notify("Failed to open pane");
                stream.close().await;
                return;
            }
        };
        let Some(reply) = self.opens.take(label.request) else {
            tracing::warn!("Unexpected stream {}, closing it", label);
            stream.close().await;
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let handle = self.handle.clone();
        let channel = self
            .channels
            .entry(label.channel)
            .or_insert_with(|| WebRtcChannel::new(label.channel, handle))
            .clone();
        if let Some(previous) = channel.bind(stream, events, generation) {
            previous.close().await;
        }
        let _ = reply.send(Ok(channel));
    }

    async fn on_control_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Open => {
                tracing::info!("Control channel open");
                self.control_open = true;
                self.flush().await;
            }
            StreamEvent::Message(data) => self.on_control_message(&data).await,
            StreamEvent::Closed => {
                tracing::debug!("Control channel closed");
                self.control_open = false;
            }
        }
    }

    async fn on_control_message(&mut self, data: &[u8]) {
        match InboundControl::parse(data) {
            Ok(InboundControl::Ack(reply)) => self.on_reply(reply, true).await,
            Ok(InboundControl::Nack(reply)) => self.on_reply(reply, false).await,
            Ok(InboundControl::Request { kind, args }) if kind == "set_payload" => {
                if let Some(payload) = payload_from_body(&args) {
                    let _ = self.events.send(SessionEvent::PayloadUpdated(payload));
                }
            }
            Ok(InboundControl::Request { kind, .. }) => {
                tracing::debug!("Ignoring control request {:?} from peer", kind)
            }
            Err(e) => tracing::warn!("Dropping malformed control message: {}", e),
        }
    }

    async fn on_reply(&mut self, reply: ControlReply, ack: bool) {
        let Some(responder) = self.control.resolve(&reply) else {
            tracing::debug!("Reply to unknown message {}", reply.reference);
            return;
        };
        let ControlReply { reference, body } = reply;
        match (responder, ack) {
            (Responder::Reply(tx), true) => {
                let _ = tx.send(Ok(body));
            }
            (Responder::Reply(tx), false) => {
                let _ = tx.send(Err(SessionError::Rejected(body)));
            }
            (Responder::Mark(tx), true) => {
                let marker = Marker::from_body(&body);
                self.release_peer().await;
                self.state = SessionState::Disconnected;
                match marker {
                    Ok(marker) => {
                        tracing::info!("Disconnected with marker {}", marker);
                        self.marker = Some(marker);
                        self.publish();
                        let _ = tx.send(Ok(Some(marker)));
                    }
                    Err(e) => {
                        self.publish();
                        let _ = tx.send(Err(e.into()));
                    }
                }
            }
            (Responder::Mark(tx), false) => {
                let _ = tx.send(Err(SessionError::Rejected(body)));
            }
            (Responder::Restore, true) => {
                tracing::info!("Restored session state");
                self.set_state(SessionState::Connected, None);
            }
            (Responder::Restore, false) => {
                self.ctx.notify("Failed to restore from marker");
                self.abort(SessionState::Failed, Some(Failure::BadMarker))
                    .await;
            }
            (Responder::Open, true) => {
                tracing::debug!("Open request {} acknowledged", reference);
            }
            (Responder::Open, false) => {
                if let Some(tx) = self.opens.take(reference) {
                    let _ = tx.send(Err(SessionError::Rejected(body)));
                }
            }
        }
    }

    async fn on_control_timeout(&mut self, id: MessageId, responder: Responder) {
        tracing::warn!("Control message {} timed out", id);
        if let Responder::Open = responder {
            if let Some(reply) = self.opens.take(id) {
                let _ = reply.send(Err(SessionError::Failed(Failure::TimedOut)));
            }
        } else {
            responder.reject(SessionError::Failed(Failure::TimedOut));
        }
        self.abort(SessionState::Failed, Some(Failure::TimedOut))
            .await;
    }
}
