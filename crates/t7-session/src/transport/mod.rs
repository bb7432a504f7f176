//! Transport abstractions
//!
//! Sessions never touch a concrete WebRTC stack. They drive a
//! [`PeerConnector`] and the [`PeerConnection`] it returns, and read the
//! connection's [`PeerEvent`]s from a channel. [`rtc`] adapts the `webrtc`
//! crate to these traits; tests substitute in-process fakes.
//!
//! [`ssh`] is the SSH counterpart used by SSH and hybrid sessions.

pub mod rtc;
pub mod ssh;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use t7_core::{IceServer, ReadyState, TransportError};
use t7_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

pub use rtc::RtcConnector;
pub use ssh::{SshStream, SshTransport};

/// Connection state reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events raised by a peer connection
pub enum PeerEvent {
    StateChanged(PeerState),
    /// A local offer must be created and signaled
    NegotiationNeeded,
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),
    /// ICE gathering failed against a STUN/TURN server
    IceCandidateError { code: u16 },
    /// The peer opened a stream and it reached `open`
    StreamOpened {
        stream: Arc<dyn DataStream>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::StateChanged(s) => write!(f, "StateChanged({:?})", s),
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            PeerEvent::IceCandidateError { code } => write!(f, "IceCandidateError({})", code),
            PeerEvent::StreamOpened { stream, .. } => {
                write!(f, "StreamOpened({:?})", stream.label())
            }
        }
    }
}

/// Events raised by one data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Open,
    Message(Bytes),
    Closed,
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransportError>;
}

/// One WebRTC peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create a locally initiated data stream
    async fn create_data_stream(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataStream>, mpsc::UnboundedReceiver<StreamEvent>), TransportError>;

    async fn close(&self);
}

/// One multiplexed stream of a peer connection
#[async_trait]
pub trait DataStream: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}
