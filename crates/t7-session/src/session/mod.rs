//! Session variants
//!
//! - [`WebRtcSession`]: resumable, multiplexed, signaling via peerbook,
//!   HTTP or any other [`Signaling`](crate::signaling::Signaling)
//! - [`SshSession`]: one exec'd command per channel, not resumable
//! - [`HybridSession`]: SSH that upgrades itself to WebRTC when the remote
//!   signaling helper is installed

pub mod hybrid;
pub mod ssh;
pub mod webrtc;

pub use hybrid::{HelperLauncher, HelperStream, HybridSession, SshLauncher};
pub use ssh::SshSession;
pub use webrtc::WebRtcSession;
