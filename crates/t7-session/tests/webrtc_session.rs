//! WebRTC session integration tests
//!
//! Drives the session engine end to end over in-process fakes of the peer
//! connection and the signaling strategy.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use t7_core::{
    Channel, ChannelTarget, Failure, ReadyState, Session, SessionError, SessionEvent,
    SessionEvents, SessionState,
};
use t7_protocol::{ChannelId, Marker, SessionDescription, TerminalSize};
use t7_session::signaling::SignalMessage;
use t7_session::transport::{PeerEvent, PeerState};
use t7_session::WebRtcSession;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{context, FakeConnector, FakePeer, FakeSignaling, FakeStream, RecordingNotifier};

struct Harness {
    session: Arc<WebRtcSession>,
    events: SessionEvents,
    peers: mpsc::UnboundedReceiver<Arc<FakePeer>>,
    signaling: Arc<FakeSignaling>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new() -> Self {
        let (ctx, notifier) = context();
        let (connector, peers) = FakeConnector::new();
        let signaling = FakeSignaling::new();
        let (session, events) = WebRtcSession::new(ctx, connector, signaling.clone());
        Self {
            session: Arc::new(session),
            events,
            peers,
            signaling,
            notifier,
        }
    }

    /// Start boarding and hand back the peer and its control stream
    async fn board(&mut self, marker: Option<Marker>) -> (Arc<FakePeer>, Arc<FakeStream>) {
        self.session.connect(marker, None).await.unwrap();
        let peer = self.next_peer().await;
        let control = peer.control().await;
        (peer, control)
    }

    async fn next_peer(&mut self) -> Arc<FakePeer> {
        timeout(Duration::from_secs(1), self.peers.recv())
            .await
            .expect("no peer connection created")
            .expect("connector dropped")
    }

    /// Board without a marker and wait for `connected`
    async fn connected(&mut self) -> (Arc<FakePeer>, Arc<FakeStream>) {
        let (peer, control) = self.board(None).await;
        peer.emit(PeerEvent::StateChanged(PeerState::Connected));
        control.open();
        assert_eq!(
            self.outcome().await,
            Some((SessionState::Connected, None))
        );
        (peer, control)
    }

    async fn outcome(&mut self) -> Option<(SessionState, Option<Failure>)> {
        timeout(Duration::from_secs(1), self.events.wait_for_outcome())
            .await
            .expect("no outcome reported")
    }

    /// Open a channel and answer it with a stream for `channel`
    async fn open(
        &self,
        peer: &FakePeer,
        control: &FakeStream,
        target: ChannelTarget,
        channel: u32,
    ) -> (Arc<dyn Channel>, Arc<FakeStream>, Value) {
        let sent_before = control.sent_json().len();
        let session = self.session.clone();
        let task = tokio::spawn(async move { session.open_channel(target).await });

        let sent = control.wait_sent(sent_before + 1).await;
        let request = sent[sent_before].clone();
        let label = format!("{}:{}", request["message_id"], channel);
        let stream = peer.open_stream(&label);

        let opened = task.await.unwrap().unwrap();
        (opened, stream, request)
    }
}

fn message_id(message: &Value) -> u64 {
    message["message_id"].as_u64().unwrap()
}

#[tokio::test]
async fn test_connect_reports_connected() {
    let mut h = Harness::new();
    let (peer, _control) = h.connected().await;

    assert_eq!(h.session.state(), SessionState::Connected);
    assert!(!h.session.is_ssh());
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_offer_and_answer_go_through_signaling() {
    let mut h = Harness::new();
    let (peer, _control) = h.board(None).await;

    peer.emit(PeerEvent::NegotiationNeeded);
    common::eventually(|| (h.signaling.offers().len() == 1).then_some(())).await;

    h.signaling
        .inject(SignalMessage::Description(SessionDescription::answer("v=0 answer")));
    let remote = common::eventually(|| peer.remote_descriptions().pop()).await;
    assert_eq!(remote.sdp, "v=0 answer");
}

#[tokio::test]
async fn test_bad_remote_description_fails() {
    let mut h = Harness::new();
    let (peer, _control) = h.board(None).await;

    h.signaling
        .inject(SignalMessage::Description(SessionDescription::answer("")));
    assert_eq!(
        h.outcome().await,
        Some((SessionState::Failed, Some(Failure::BadRemoteDescription)))
    );
    assert!(peer.is_closed());
}

#[tokio::test]
async fn test_unauthorized_signaling() {
    let mut h = Harness::new();
    let (_peer, _control) = h.board(None).await;

    h.signaling.inject(SignalMessage::Failed(Failure::Unauthorized));
    assert_eq!(
        h.outcome().await,
        Some((SessionState::Unauthorized, Some(Failure::Unauthorized)))
    );
}

#[tokio::test]
async fn test_peer_failure_maps_to_failed_to_connect() {
    let mut h = Harness::new();
    let (peer, _control) = h.board(None).await;

    peer.emit(PeerEvent::StateChanged(PeerState::Failed));
    assert_eq!(
        h.outcome().await,
        Some((SessionState::Failed, Some(Failure::FailedToConnect)))
    );
}

#[tokio::test]
async fn test_queued_add_pane_binds_channel() {
    let mut h = Harness::new();
    let (peer, control) = h.board(None).await;

    // Requested before the control stream opens
    let session = h.session.clone();
    let task = tokio::spawn(async move {
        session
            .open_channel(ChannelTarget::command("bash").with_size(TerminalSize::new(30, 100)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(control.sent().is_empty());

    peer.emit(PeerEvent::StateChanged(PeerState::Connected));
    control.open();
    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "add_pane");
    assert_eq!(sent[0]["message_id"], 0);
    assert_eq!(sent[0]["args"]["command"], json!(["bash"]));
    assert_eq!(sent[0]["args"]["rows"], 30);
    assert_eq!(sent[0]["args"]["cols"], 100);

    let stream = peer.open_stream("0:7");
    let channel = task.await.unwrap().unwrap();
    assert_eq!(channel.id(), ChannelId::new(7));
    assert_eq!(channel.ready_state(), ReadyState::Open);

    control.ack(0, Value::Null);
    channel.send(Bytes::from_static(b"ls\n")).await.unwrap();
    assert_eq!(stream.sent(), vec![Bytes::from_static(b"ls\n")]);
}

#[tokio::test]
async fn test_data_before_handler_is_buffered() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;
    let (channel, stream, _) = h
        .open(&peer, &control, ChannelTarget::command("bash"), 3)
        .await;

    stream.deliver("first");
    stream.deliver("second");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.on_message(Box::new(move |data| {
        let _ = tx.send(data);
    }));
    assert_eq!(rx.recv().await.unwrap(), Bytes::from("first"));
    assert_eq!(rx.recv().await.unwrap(), Bytes::from("second"));

    stream.deliver("third");
    assert_eq!(rx.recv().await.unwrap(), Bytes::from("third"));
}

#[tokio::test]
async fn test_remote_close_fires_on_close() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;
    let (channel, stream, _) = h
        .open(&peer, &control, ChannelTarget::command("bash"), 3)
        .await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    channel.on_close(Box::new(move || {
        let _ = tx.send(());
    }));
    stream.remote_close();

    timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    assert_eq!(channel.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_resize_sends_control_message() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;
    let (channel, _stream, _) = h
        .open(&peer, &control, ChannelTarget::command("bash"), 5)
        .await;

    let resize = tokio::spawn(async move { channel.resize(TerminalSize::new(40, 120)).await });
    let sent = control.wait_sent(2).await;
    assert_eq!(sent[1]["type"], "resize");
    assert_eq!(sent[1]["args"]["pane_id"], 5);
    assert_eq!(sent[1]["args"]["sx"], 120);
    assert_eq!(sent[1]["args"]["sy"], 40);

    control.ack(message_id(&sent[1]), Value::Null);
    resize.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_nack_rejects_open() {
    let mut h = Harness::new();
    let (_peer, control) = h.connected().await;

    let session = h.session.clone();
    let task =
        tokio::spawn(async move { session.open_channel(ChannelTarget::command("nope")).await });
    let sent = control.wait_sent(1).await;
    control.nack(message_id(&sent[0]), json!("no such command"));

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SessionError::Rejected(body)) if body == json!("no such command")));
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_payload_round_trip() {
    let mut h = Harness::new();
    let (_peer, control) = h.connected().await;

    let session = h.session.clone();
    let get = tokio::spawn(async move { session.get_payload().await });
    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "get_payload");
    control.ack(message_id(&sent[0]), json!({"Payload": "{\"windows\":[]}"}));
    assert_eq!(
        get.await.unwrap().unwrap(),
        Some("{\"windows\":[]}".to_string())
    );

    let session = h.session.clone();
    let set = tokio::spawn(async move { session.set_payload("layout".to_string()).await });
    let sent = control.wait_sent(2).await;
    assert_eq!(sent[1]["type"], "set_payload");
    assert_eq!(sent[1]["args"]["Payload"], "layout");
    control.ack(message_id(&sent[1]), Value::Null);
    set.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_peer_pushed_payload_is_surfaced() {
    let mut h = Harness::new();
    let (_peer, control) = h.connected().await;

    control.deliver(json!({"type": "set_payload", "args": {"Payload": "new layout"}}).to_string());
    let event = timeout(Duration::from_secs(1), h.events.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(SessionEvent::PayloadUpdated("new layout".to_string()))
    );
}

#[tokio::test]
async fn test_malformed_control_message_is_dropped() {
    let mut h = Harness::new();
    let (_peer, control) = h.connected().await;

    control.deliver("not json");
    control.ack(99, Value::Null);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.session.state(), SessionState::Connected);
    assert!(h.events.try_recv().is_none());
}

#[tokio::test]
async fn test_disconnect_returns_marker_and_detaches_channels() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;
    let (first, first_stream, _) = h
        .open(&peer, &control, ChannelTarget::command("bash"), 1)
        .await;
    let (second, second_stream, _) = h
        .open(&peer, &control, ChannelTarget::command("top"), 2)
        .await;

    let session = h.session.clone();
    let disconnect = tokio::spawn(async move { session.disconnect().await });
    let sent = control.wait_sent(3).await;
    assert_eq!(sent[2]["type"], "mark");
    control.ack(message_id(&sent[2]), json!(42));

    let marker = disconnect.await.unwrap().unwrap();
    assert_eq!(marker, Some(Marker::new(42)));
    assert_eq!(h.session.marker(), Some(Marker::new(42)));
    assert_eq!(h.session.state(), SessionState::Disconnected);

    assert_eq!(first.ready_state(), ReadyState::Disconnected);
    assert_eq!(second.ready_state(), ReadyState::Disconnected);
    assert!(first_stream.is_closed());
    assert!(second_stream.is_closed());
    assert!(control.is_closed());
    assert!(peer.is_closed());
    assert!(matches!(
        first.send(Bytes::from_static(b"x")).await,
        Err(SessionError::ChannelDisconnected(_))
    ));

    // Disconnecting is quiet
    assert!(h.events.try_recv().is_none());
}

#[tokio::test]
async fn test_reconnect_restores_and_reattaches() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;
    let (channel, _stream, _) = h
        .open(&peer, &control, ChannelTarget::command("bash"), 7)
        .await;

    let session = h.session.clone();
    let disconnect = tokio::spawn(async move { session.disconnect().await });
    let sent = control.wait_sent(2).await;
    control.ack(message_id(&sent[1]), json!(42));
    disconnect.await.unwrap().unwrap();

    // Reconnect without an explicit marker uses the stored one
    h.session.reconnect(None, None).await.unwrap();
    let peer = h.next_peer().await;
    let control = peer.control().await;
    peer.emit(PeerEvent::StateChanged(PeerState::Connected));
    control.open();

    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "restore");
    assert_eq!(sent[0]["args"]["marker"], 42);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_ne!(h.session.state(), SessionState::Connected);

    control.ack(message_id(&sent[0]), Value::Null);
    assert_eq!(h.outcome().await, Some((SessionState::Connected, None)));

    let (reattached, stream, request) = h
        .open(&peer, &control, ChannelTarget::Existing(ChannelId::new(7)), 7)
        .await;
    assert_eq!(request["type"], "reconnect_pane");
    assert_eq!(request["args"]["id"], 7);
    assert_eq!(reattached.id(), ChannelId::new(7));

    // The consumer's original handle is rebound to the new stream
    assert_eq!(channel.ready_state(), ReadyState::Open);
    channel.send(Bytes::from_static(b"pwd\n")).await.unwrap();
    assert_eq!(stream.sent(), vec![Bytes::from_static(b"pwd\n")]);
}

#[tokio::test]
async fn test_single_connected_after_restore() {
    let mut h = Harness::new();
    let (peer, control) = h.board(Some(Marker::new(42))).await;
    peer.emit(PeerEvent::StateChanged(PeerState::Connected));
    control.open();

    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "restore");
    control.ack(message_id(&sent[0]), Value::Null);

    let mut connected = 0;
    while let Ok(Some(event)) = timeout(Duration::from_millis(50), h.events.recv()).await {
        if event == SessionEvent::state(SessionState::Connected) {
            connected += 1;
        }
    }
    assert_eq!(connected, 1);
}

#[tokio::test]
async fn test_restore_nack_fails_with_bad_marker() {
    let mut h = Harness::new();
    let (peer, control) = h.board(Some(Marker::new(5))).await;
    peer.emit(PeerEvent::StateChanged(PeerState::Connected));
    control.open();

    let sent = control.wait_sent(1).await;
    control.nack(message_id(&sent[0]), Value::Null);

    assert_eq!(
        h.outcome().await,
        Some((SessionState::Failed, Some(Failure::BadMarker)))
    );
    assert!(h
        .notifier
        .messages()
        .contains(&"Failed to restore from marker".to_string()));
}

#[tokio::test]
async fn test_disconnect_without_transport_returns_current_marker() {
    let h = Harness::new();
    let marker = timeout(Duration::from_secs(1), h.session.disconnect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker, None);
}

#[tokio::test(start_paused = true)]
async fn test_control_watchdog_times_out() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;

    let session = h.session.clone();
    let get = tokio::spawn(async move { session.get_payload().await });
    control.wait_sent(1).await;

    let result = get.await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::Failed(Failure::TimedOut))
    ));
    assert_eq!(
        h.outcome().await,
        Some((SessionState::Failed, Some(Failure::TimedOut)))
    );
    assert!(peer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_boarding_watchdog_times_out() {
    let mut h = Harness::new();
    let (peer, _control) = h.board(None).await;

    // Nothing answers; the clock runs up to the boarding watchdog
    assert_eq!(
        h.events.wait_for_outcome().await,
        Some((SessionState::Failed, Some(Failure::TimedOut)))
    );
    assert!(peer.is_closed());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;

    h.session.close().await;
    h.session.close().await;
    assert!(peer.is_closed());
    assert!(control.is_closed());
    assert_eq!(h.session.state(), SessionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.events.try_recv().is_none());
}

#[tokio::test]
async fn test_close_before_connect_stays_new() {
    let h = Harness::new();
    h.session.close().await;
    assert_eq!(h.session.state(), SessionState::New);
}

#[tokio::test]
async fn test_close_keeps_failure_state() {
    let mut h = Harness::new();
    let (_peer, _control) = h.connected().await;
    h.session.fail(Some(Failure::Aborted));
    h.outcome().await;

    h.session.close().await;
    assert_eq!(h.session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_bad_label_closes_only_that_stream() {
    let mut h = Harness::new();
    let (peer, control) = h.connected().await;

    let stream = peer.open_stream("not-a-label");
    common::eventually(|| stream.is_closed().then_some(())).await;

    assert!(h
        .notifier
        .messages()
        .contains(&"Failed to open pane".to_string()));
    assert!(!control.is_closed());
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_ice_auth_error_retries_once() {
    let mut h = Harness::new();
    let (first, _control) = h.board(None).await;

    first.emit(PeerEvent::IceCandidateError { code: 401 });
    let second = h.next_peer().await;
    assert!(first.is_closed());
    assert!(h
        .notifier
        .messages()
        .contains(&"Getting fresh ICE servers".to_string()));

    second.control().await;
    second.emit(PeerEvent::IceCandidateError { code: 401 });
    let third = timeout(Duration::from_millis(100), h.peers.recv()).await;
    assert!(third.is_err());
    assert!(!second.is_closed());
}

#[tokio::test]
async fn test_fail_aborts_pending_requests() {
    let mut h = Harness::new();
    let (_peer, control) = h.connected().await;

    let session = h.session.clone();
    let get = tokio::spawn(async move { session.get_payload().await });
    control.wait_sent(1).await;

    h.session.fail(Some(Failure::Aborted));
    assert!(matches!(
        get.await.unwrap(),
        Err(SessionError::Failed(Failure::Aborted))
    ));
    assert_eq!(
        h.outcome().await,
        Some((SessionState::Failed, Some(Failure::Aborted)))
    );
}
