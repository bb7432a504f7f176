//! In-process fakes of the transport and signaling seams

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use t7_core::config::NetConfig;
use t7_core::{IceServer, Notifier, ReadyState, SessionContext, SessionError, TransportError};
use t7_protocol::{IceCandidate, SessionDescription};
use t7_session::signaling::{SignalMessage, Signaling};
use t7_session::transport::{
    DataStream, PeerConnection, PeerConnector, PeerEvent, StreamEvent,
};
use tokio::sync::mpsc;

/// Poll `check` until it yields a value
///
/// Works with paused time as well; every retry advances the clock by 1ms.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..2000 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

/// Context with short, deterministic timeouts and a recording notifier
pub fn context() -> (SessionContext, Arc<RecordingNotifier>) {
    let net = NetConfig {
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = SessionContext::new(net).with_notifier(notifier.clone());
    (ctx, notifier)
}

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<String>>);

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

/// A data stream whose far end is driven by the test
pub struct FakeStream {
    label: String,
    state: Mutex<ReadyState>,
    sent: Mutex<Vec<Bytes>>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl FakeStream {
    pub fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ReadyState::Connecting),
            sent: Mutex::new(Vec::new()),
            events,
        });
        (stream, rx)
    }

    /// A stream that is already open, as the peer hands them out
    pub fn opened(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (stream, rx) = Self::new(label);
        *stream.state.lock().unwrap() = ReadyState::Open;
        (stream, rx)
    }

    pub fn open(&self) {
        *self.state.lock().unwrap() = ReadyState::Open;
        let _ = self.events.send(StreamEvent::Open);
    }

    /// Data from the remote side
    pub fn deliver(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(StreamEvent::Message(data.into()));
    }

    /// Answer a control message
    pub fn ack(&self, reference: u64, body: Value) {
        let reply = json!({"type": "ack", "args": {"ref": reference, "body": body}});
        self.deliver(reply.to_string());
    }

    pub fn nack(&self, reference: u64, body: Value) {
        let reply = json!({"type": "nack", "args": {"ref": reference, "body": body}});
        self.deliver(reply.to_string());
    }

    pub fn remote_close(&self) {
        *self.state.lock().unwrap() = ReadyState::Closed;
        let _ = self.events.send(StreamEvent::Closed);
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() == ReadyState::Closed
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Everything written so far, parsed as JSON
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|data| serde_json::from_slice(data).ok())
            .collect()
    }

    /// Wait until `n` JSON messages were written and return them
    pub async fn wait_sent(&self, n: usize) -> Vec<Value> {
        eventually(|| {
            let sent = self.sent_json();
            (sent.len() >= n).then_some(sent)
        })
        .await
    }
}

#[async_trait]
impl DataStream for FakeStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if *self.state.lock().unwrap() != ReadyState::Open {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn close(&self) {
        *self.state.lock().unwrap() = ReadyState::Closed;
    }
}

/// A peer connection driven by the test
pub struct FakePeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    ice_servers: Vec<IceServer>,
    control: Mutex<Option<Arc<FakeStream>>>,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// Open a stream from the remote side
    pub fn open_stream(&self, label: &str) -> Arc<FakeStream> {
        let (stream, events) = FakeStream::opened(label);
        self.emit(PeerEvent::StreamOpened {
            stream: stream.clone(),
            events,
        });
        stream
    }

    /// The control stream, once the session has created it
    pub async fn control(&self) -> Arc<FakeStream> {
        eventually(|| self.control.lock().unwrap().clone()).await
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if desc.sdp.is_empty() {
            return Err(TransportError::WebRtc("empty description".to_string()));
        }
        self.remote.lock().unwrap().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn create_data_stream(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataStream>, mpsc::UnboundedReceiver<StreamEvent>), TransportError> {
        let (stream, events) = FakeStream::new(label);
        *self.control.lock().unwrap() = Some(stream.clone());
        Ok((stream, events))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands every peer it creates to the test
pub struct FakeConnector {
    peers: mpsc::UnboundedSender<Arc<FakePeer>>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<FakePeer>>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { peers }), rx)
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransportError>
    {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            events,
            ice_servers: ice_servers.to_vec(),
            control: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let _ = self.peers.send(peer.clone());
        Ok((peer, rx))
    }
}

/// Signaling whose remote side is driven by the test
#[derive(Default)]
pub struct FakeSignaling {
    inbound: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
    offers: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject(&self, message: SignalMessage) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    pub fn offers(&self) -> Vec<SessionDescription> {
        self.offers.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signaling for FakeSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SessionError> {
        self.offers.lock().unwrap().push(offer.clone());
        Ok(())
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }
}
