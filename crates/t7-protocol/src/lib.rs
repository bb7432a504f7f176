//! t7-protocol: Wire protocol for t7 sessions
//!
//! This crate defines the JSON messages exchanged with the remote peer over
//! the reserved control channel, the labels carried by multiplexed data
//! streams, and the payloads used to exchange WebRTC connection-setup data
//! through each signaling strategy.

pub mod control;
pub mod error;
pub mod ids;
pub mod label;
pub mod signaling;

pub use control::{ControlMessage, ControlReply, ControlRequest, InboundControl, TerminalSize};
pub use error::ProtocolError;
pub use ids::{ChannelId, Marker, MessageId};
pub use label::{ChannelLabel, CONTROL_LABEL};
pub use signaling::{
    BrokerEnvelope, HttpConnectRequest, IceCandidate, SdpKind, SessionDescription, SignalPayload,
};
