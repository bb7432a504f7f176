//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use t7_protocol::{ChannelId, TerminalSize};

/// Why a session stopped boarding
///
/// Transport specific errors are normalized to one of these kinds at the
/// session boundary and surfaced alongside the `failed`, `unauthorized` and
/// `wrong password` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Failure {
    NotImplemented,
    WrongPassword,
    Unauthorized,
    BadMarker,
    BadRemoteDescription,
    NotSupported,
    WebexecNotFound,
    TimedOut,
    Aborted,
    KeyRejected,
    WrongAddress,
    DataChannelLost,
    FailedToConnect,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Failure::NotImplemented => "Not Implemented",
            Failure::WrongPassword => "Wrong Password",
            Failure::Unauthorized => "Unauthorized",
            Failure::BadMarker => "Bad Marker",
            Failure::BadRemoteDescription => "Bad Remote Description",
            Failure::NotSupported => "Not Supported",
            Failure::WebexecNotFound => "Webexec Not Found",
            Failure::TimedOut => "Timeout",
            Failure::Aborted => "Aborted",
            Failure::KeyRejected => "Key Rejected",
            Failure::WrongAddress => "Wrong Address",
            Failure::DataChannelLost => "Data Channel Lost",
            Failure::FailedToConnect => "Failed To Connect",
        };
        write!(f, "{}", s)
    }
}

/// Session lifecycle state as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Reconnected,
    Disconnected,
    Failed,
    Unauthorized,
    WrongPassword,
}

impl SessionState {
    /// States that end a boarding attempt without a usable transport
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionState::Failed | SessionState::Unauthorized | SessionState::WrongPassword
        )
    }

    /// States in which channels can be opened
    pub fn is_boarded(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnected => "reconnected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Unauthorized => "unauthorized",
            SessionState::WrongPassword => "wrong password",
        };
        write!(f, "{}", s)
    }
}

/// Readiness of a channel's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// The logical channel is retained but bound to no live stream
    Disconnected,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
            ReadyState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// Credentials for SSH based sessions
#[derive(Clone)]
pub enum Credentials {
    /// Password authentication
    Password(String),
    /// Public key authentication with an OpenSSH or PEM private key
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Credentials::Password(..)"),
            Credentials::Key { .. } => f.write_str("Credentials::Key(..)"),
        }
    }
}

/// What a new channel should be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// Start a new remote process
    Command {
        command: String,
        parent: Option<ChannelId>,
        size: TerminalSize,
    },
    /// Re-attach to a process that survived a disconnect
    Existing(ChannelId),
}

impl ChannelTarget {
    /// A top level command with the default geometry
    pub fn command(command: impl Into<String>) -> Self {
        ChannelTarget::Command {
            command: command.into(),
            parent: None,
            size: TerminalSize::default(),
        }
    }

    /// Set the parent pane of a command target
    pub fn with_parent(mut self, id: ChannelId) -> Self {
        if let ChannelTarget::Command { parent, .. } = &mut self {
            *parent = Some(id);
        }
        self
    }

    /// Set the initial geometry of a command target
    pub fn with_size(mut self, new_size: TerminalSize) -> Self {
        if let ChannelTarget::Command { size, .. } = &mut self {
            *size = new_size;
        }
        self
    }
}

/// A STUN or TURN server handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Browsers accept a single URL string here as well
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A server reachable without credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}
