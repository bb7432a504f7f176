//! t7-core: Core session contracts and configuration for t7
//!
//! This crate provides the types shared by every session variant: the
//! failure taxonomy and state machine vocabulary, the `Session` and
//! `Channel` contracts consumed by front ends, the explicit context a
//! session is constructed with, and the TOML client configuration.

pub mod config;
pub mod context;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use context::{
    FingerprintProvider, IceServerProvider, Notifier, SessionContext, StaticFingerprint,
    StaticIceServers, TracingNotifier,
};
pub use error::{ConfigError, SessionError, T7Error, TransportError};
pub use traits::{Channel, CloseHandler, MessageHandler, Session, SessionEvent, SessionEvents};
pub use types::{ChannelTarget, Credentials, Failure, IceServer, ReadyState, SessionState};
