//! Hybrid session integration tests
//!
//! The SSH login is replaced by a launcher that hands out fake helper
//! terminals, so the upgrade to WebRTC runs end to end over the fakes in
//! `common`.

mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use t7_core::{
    Channel, ChannelTarget, Credentials, Failure, Session, SessionEvent, SessionEvents,
    SessionState,
};
use t7_protocol::{ChannelId, Marker, SessionDescription};
use t7_session::signaling::{SentLog, SignalMessage, Signaling, TunnelSignaling};
use t7_session::transport::{DataStream, PeerEvent, PeerState};
use t7_session::{HelperLauncher, HelperStream, HybridSession, SshSession, SshTarget};
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{context, FakeConnector, FakePeer, FakeStream, RecordingNotifier};

type Launch = Result<Option<HelperStream>, (SessionState, Failure)>;

/// Hands out queued launch outcomes; an empty queue means "no helper"
#[derive(Default)]
struct FakeLauncher {
    outcomes: Mutex<VecDeque<Launch>>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    fn push(&self, outcome: Launch) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Queue a helper that starts, returning its terminal
    fn helper(&self) -> Arc<FakeStream> {
        let (setup, output) = FakeStream::opened("helper");
        let stream: Arc<dyn DataStream> = setup.clone();
        self.push(Ok(Some((stream, output))));
        setup
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HelperLauncher for FakeLauncher {
    async fn launch(&self, _ssh: &SshSession, _credentials: Option<&Credentials>) -> Launch {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}

struct Harness {
    session: Arc<HybridSession>,
    events: SessionEvents,
    peers: mpsc::UnboundedReceiver<Arc<FakePeer>>,
    launcher: Arc<FakeLauncher>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new() -> Self {
        let (ctx, notifier) = context();
        let (connector, peers) = FakeConnector::new();
        let launcher = Arc::new(FakeLauncher::default());
        let target = SshTarget {
            host: "example.com".to_string(),
            port: 22,
            username: "me".to_string(),
        };
        let (session, events) =
            HybridSession::with_launcher(ctx, target, "xterm", launcher.clone(), connector);
        Self {
            session: Arc::new(session),
            events,
            peers,
            launcher,
            notifier,
        }
    }

    async fn next_peer(&mut self) -> Arc<FakePeer> {
        timeout(Duration::from_secs(1), self.peers.recv())
            .await
            .expect("no peer connection created")
            .expect("connector dropped")
    }

    async fn outcome(&mut self) -> Option<(SessionState, Option<Failure>)> {
        timeout(Duration::from_secs(1), self.events.wait_for_outcome())
            .await
            .expect("no outcome reported")
    }

    /// Connect, let the helper come up and board the inner session
    async fn upgraded(&mut self) -> (Arc<FakeStream>, Arc<FakePeer>, Arc<FakeStream>) {
        let setup = self.launcher.helper();
        self.session.connect(None, None).await.unwrap();
        setup.deliver("Last login: today\r\nREADY\r\n");

        let peer = self.next_peer().await;
        let control = peer.control().await;
        peer.emit(PeerEvent::StateChanged(PeerState::Connected));
        control.open();
        assert_eq!(self.outcome().await, Some((SessionState::Connected, None)));
        (setup, peer, control)
    }
}

fn message_id(message: &Value) -> u64 {
    message["message_id"].as_u64().unwrap()
}

async fn offer_written(setup: &FakeStream) -> Value {
    common::eventually(|| {
        setup
            .sent_json()
            .into_iter()
            .find(|message| message["type"] == "offer")
    })
    .await
}

#[tokio::test]
async fn test_missing_helper_stays_on_ssh() {
    let mut h = Harness::new();
    let setup = h.launcher.helper();
    h.session.connect(None, None).await.unwrap();
    setup.deliver("bash: webexec: No such file or directory\r\n");

    assert_eq!(h.outcome().await, Some((SessionState::Connected, None)));
    assert!(h.session.is_ssh());
    assert!(setup.is_closed());
    assert!(h
        .notifier
        .messages()
        .contains(&"webexec not found, using plain SSH".to_string()));
}

#[tokio::test]
async fn test_helper_that_fails_to_start_stays_on_ssh() {
    let mut h = Harness::new();
    h.launcher.push(Ok(None));
    h.session.connect(None, None).await.unwrap();

    assert_eq!(h.outcome().await, Some((SessionState::Connected, None)));
    assert!(h.session.is_ssh());
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test]
async fn test_helper_exit_before_ready_stays_on_ssh() {
    let mut h = Harness::new();
    let setup = h.launcher.helper();
    h.session.connect(None, None).await.unwrap();
    setup.deliver("starting\r\n");
    setup.remote_close();

    assert_eq!(h.outcome().await, Some((SessionState::Connected, None)));
    assert!(h.session.is_ssh());
    assert!(h.peers.try_recv().is_err());
}

#[tokio::test]
async fn test_login_failure_is_reported() {
    let mut h = Harness::new();
    h.launcher
        .push(Err((SessionState::WrongPassword, Failure::WrongPassword)));
    h.session.connect(None, None).await.unwrap();

    assert_eq!(
        h.outcome().await,
        Some((SessionState::WrongPassword, Some(Failure::WrongPassword)))
    );
    assert!(h.session.is_ssh());
}

#[tokio::test(start_paused = true)]
async fn test_silent_helper_times_out() {
    let mut h = Harness::new();
    let setup = h.launcher.helper();
    h.session.connect(None, None).await.unwrap();

    assert_eq!(
        h.events.wait_for_outcome().await,
        Some((SessionState::Failed, Some(Failure::TimedOut)))
    );
    assert!(setup.is_closed());
}

#[tokio::test]
async fn test_signaling_runs_through_the_helper() {
    let mut h = Harness::new();
    let setup = h.launcher.helper();
    h.session.connect(None, None).await.unwrap();
    setup.deliver("READY\n");

    let peer = h.next_peer().await;
    peer.emit(PeerEvent::NegotiationNeeded);
    let offer = offer_written(&setup).await;
    assert_eq!(offer["sdp"], "v=0 fake-offer");

    // The terminal echoes our own offer back before the answer arrives
    let echoed = setup.sent()[0].clone();
    setup.deliver(echoed);
    setup.deliver("{\"type\":\"answer\",\r\n\"sdp\":\"v=0 answer\"}\r\n");

    common::eventually(|| (!peer.remote_descriptions().is_empty()).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        peer.remote_descriptions(),
        vec![SessionDescription::answer("v=0 answer")]
    );
}

#[tokio::test]
async fn test_inner_failure_is_forwarded() {
    let mut h = Harness::new();
    let setup = h.launcher.helper();
    h.session.connect(None, None).await.unwrap();
    setup.deliver("READY\n");
    let _peer = h.next_peer().await;

    setup.deliver("{\"type\":\"answer\",\"sdp\":\"\"}\n");
    assert_eq!(
        h.outcome().await,
        Some((SessionState::Failed, Some(Failure::BadRemoteDescription)))
    );
    assert!(setup.is_closed());
    assert!(h.session.is_ssh());
}

#[tokio::test]
async fn test_upgrade_delegates_to_webrtc() {
    let mut h = Harness::new();
    let (setup, peer, control) = h.upgraded().await;

    assert!(!h.session.is_ssh());
    assert!(setup.is_closed());

    // The inner session's own connected is not reported a second time
    let mut connected = 0;
    while let Ok(Some(event)) = timeout(Duration::from_millis(50), h.events.recv()).await {
        if event == SessionEvent::state(SessionState::Connected) {
            connected += 1;
        }
    }
    assert_eq!(connected, 0);

    let session = h.session.clone();
    let open =
        tokio::spawn(async move { session.open_channel(ChannelTarget::command("bash")).await });
    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "add_pane");
    peer.open_stream(&format!("{}:3", sent[0]["message_id"]));
    let channel = open.await.unwrap().unwrap();
    assert_eq!(channel.id(), ChannelId::new(3));
}

#[tokio::test]
async fn test_reconnect_reboots_the_helper_with_marker() {
    let mut h = Harness::new();
    let (_setup, _peer, control) = h.upgraded().await;

    let session = h.session.clone();
    let disconnect = tokio::spawn(async move { session.disconnect().await });
    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "mark");
    control.ack(message_id(&sent[0]), json!(42));
    assert_eq!(disconnect.await.unwrap().unwrap(), Some(Marker::new(42)));
    assert_eq!(h.session.marker(), Some(Marker::new(42)));

    let setup = h.launcher.helper();
    h.session.reconnect(None, None).await.unwrap();
    setup.deliver("READY\n");
    let peer = h.next_peer().await;
    let control = peer.control().await;
    peer.emit(PeerEvent::StateChanged(PeerState::Connected));
    control.open();

    let sent = control.wait_sent(1).await;
    assert_eq!(sent[0]["type"], "restore");
    assert_eq!(sent[0]["args"]["marker"], 42);
    control.ack(message_id(&sent[0]), Value::Null);

    assert_eq!(h.outcome().await, Some((SessionState::Connected, None)));
    assert_eq!(h.launcher.launches(), 2);
    assert!(!h.session.is_ssh());
}

#[tokio::test]
async fn test_ice_auth_retry_renegotiates_over_the_helper() {
    let mut h = Harness::new();
    let setup = h.launcher.helper();
    h.session.connect(None, None).await.unwrap();
    setup.deliver("READY\n");

    let first = h.next_peer().await;
    first.control().await;
    first.emit(PeerEvent::IceCandidateError { code: 401 });

    let second = h.next_peer().await;
    let control = second.control().await;
    second.emit(PeerEvent::NegotiationNeeded);
    offer_written(&setup).await;
    setup.deliver("{\"type\":\"answer\",\"sdp\":\"v=0 retry\"}\n");
    let remote = common::eventually(|| second.remote_descriptions().pop()).await;
    assert_eq!(remote.sdp, "v=0 retry");

    second.emit(PeerEvent::StateChanged(PeerState::Connected));
    control.open();
    assert_eq!(h.outcome().await, Some((SessionState::Connected, None)));
    assert!(!h.session.is_ssh());
}

#[tokio::test]
async fn test_each_tunnel_open_gets_a_fresh_channel() {
    let (setup, _output) = FakeStream::opened("helper");
    let signaling = TunnelSignaling::new(setup, SentLog::default());
    let mut first = signaling.open().await.unwrap();
    let mut second = signaling.open().await.unwrap();

    let answer = SignalMessage::Description(SessionDescription::answer("v=0"));
    signaling.deliver(answer.clone());
    assert_eq!(second.recv().await, Some(answer));
    assert!(first.recv().await.is_none());
}
