//! Signaling strategies
//!
//! A WebRTC session needs one offer/answer exchange and a trickle of ICE
//! candidates before its transport is usable. How those travel is the
//! business of a [`Signaling`] implementation:
//!
//! - [`BrokerSignaling`]: JSON envelopes relayed by the peerbook broker
//! - [`TunnelSignaling`]: JSON lines written to a helper spawned over SSH
//! - [`HttpSignaling`]: a single `POST /connect` exchange
//!
//! All three deliver what the remote side sends through the receiver
//! returned by [`Signaling::open`].

pub mod broker;
pub mod http;
pub mod tunnel;

use async_trait::async_trait;
use t7_core::{Failure, SessionError};
use t7_protocol::{IceCandidate, SessionDescription, SignalPayload};
use tokio::sync::mpsc;

pub use broker::BrokerSignaling;
pub use http::HttpSignaling;
pub use tunnel::{SentLog, TunnelEvent, TunnelParser, TunnelSignaling};

/// Something the remote side sent during setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    /// The remote session description (normally an answer)
    Description(SessionDescription),
    /// One remote ICE candidate
    Candidate(IceCandidate),
    /// Signaling itself failed and boarding cannot continue
    Failed(Failure),
}

impl From<SignalPayload> for SignalMessage {
    fn from(payload: SignalPayload) -> Self {
        match payload {
            SignalPayload::Description(d) => SignalMessage::Description(d),
            SignalPayload::Candidate(c) => SignalMessage::Candidate(c),
        }
    }
}

/// Exchanges connection-setup data with the remote peer
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Start listening for the remote side
    ///
    /// Called once per boarding attempt, before the offer is sent.
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SessionError>;

    async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SessionError>;

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError>;
}
