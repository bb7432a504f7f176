//! Core error types for t7

use std::path::PathBuf;
use t7_protocol::{ChannelId, ProtocolError};
use thiserror::Error;

use crate::types::Failure;

/// Top-level error type for the t7 crates
#[derive(Error, Debug)]
pub enum T7Error {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the transports underneath a session
#[derive(Error, Debug)]
pub enum TransportError {
    /// SSH client error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// WebRTC stack error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// HTTP signaling error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Peerbook websocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream or connection is already closed
    #[error("Transport closed")]
    Closed,
}

/// Errors returned by session and channel operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session failed while the operation was outstanding
    #[error("Session failed: {0}")]
    Failed(Failure),

    /// The remote peer answered the request with a nack
    #[error("Request rejected by peer: {0}")]
    Rejected(serde_json::Value),

    /// The channel has no live stream
    #[error("Channel {0} is disconnected")]
    ChannelDisconnected(ChannelId),

    /// The bounded outbound queue is full
    #[error("Outbound queue full")]
    QueueFull,

    /// The operation is not available on this session variant
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// The session engine has shut down
    #[error("Session is gone")]
    Gone,

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// The failure kind carried by this error, if any
    pub fn failure(&self) -> Option<Failure> {
        match self {
            SessionError::Failed(f) => Some(*f),
            SessionError::NotSupported(_) => Some(Failure::NotSupported),
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
