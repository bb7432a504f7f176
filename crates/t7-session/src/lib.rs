//! t7-session: Resumable multiplexed terminal sessions
//!
//! This crate implements the session engines behind the `Session` and
//! `Channel` contracts of t7-core: the control-channel protocol with its
//! watchdogs, WebRTC sessions with marker-based resume, plain SSH
//! sessions, SSH-bootstrapped hybrid sessions, the signaling strategies
//! used to reach a peer, and the persistent peerbook directory connection.

pub mod backoff;
pub mod channel;
pub mod control;
pub mod ice;
pub mod peerbook;
pub mod queue;
pub mod session;
pub mod signaling;
pub mod transport;

pub use backoff::ExponentialBackoff;
pub use channel::{SshChannel, WebRtcChannel};
pub use control::ControlChannel;
pub use ice::PeerbookIceServers;
pub use peerbook::{peerbook_url, PeerbookConnection};
pub use queue::OutboundQueue;
pub use session::{HelperLauncher, HelperStream, HybridSession, SshSession, WebRtcSession};
pub use signaling::{BrokerSignaling, HttpSignaling, SignalMessage, Signaling, TunnelSignaling};
pub use transport::ssh::SshTarget;
pub use transport::{
    DataStream, PeerConnection, PeerConnector, PeerEvent, PeerState, RtcConnector, StreamEvent,
};
